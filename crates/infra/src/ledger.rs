//! Payment side effects applied by webhook handlers.
//!
//! Every write is keyed by the provider object it came from and reports whether
//! it changed anything, so re-dispatching the same event is harmless.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use learnhub_core::{PayoutId, UserId};

/// A completed course checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePurchase {
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub student_id: UserId,
    pub course_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

/// Connected-account standing of a teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Onboarding,
    Active,
    Restricted,
}

impl AccountStatus {
    /// Derive the standing from the provider's capability flags.
    pub fn from_capabilities(
        charges_enabled: bool,
        payouts_enabled: bool,
        details_submitted: bool,
    ) -> Self {
        match (charges_enabled && payouts_enabled, details_submitted) {
            (true, _) => AccountStatus::Active,
            (false, true) => AccountStatus::Restricted,
            (false, false) => AccountStatus::Onboarding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    Succeeded { amount_cents: i64, currency: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Ledger seam behind the webhook handlers.
///
/// Each method returns `Ok(false)` when the effect was already applied.
pub trait PaymentLedger: Send + Sync {
    fn record_purchase(&self, purchase: &CoursePurchase) -> Result<bool, LedgerError>;

    fn record_payment_succeeded(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<bool, LedgerError>;

    fn record_payment_failed(
        &self,
        payment_intent_id: &str,
        reason: &str,
    ) -> Result<bool, LedgerError>;

    /// `amount_refunded` is the cumulative refunded amount on the charge.
    fn record_refund(&self, charge_id: &str, amount_refunded: i64) -> Result<bool, LedgerError>;

    fn record_dispute(
        &self,
        dispute_id: &str,
        charge_id: &str,
        amount_cents: i64,
    ) -> Result<bool, LedgerError>;

    fn update_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<bool, LedgerError>;

    /// Credit a paid-out amount to the teacher. At most once per payout.
    fn credit_payout(
        &self,
        payout_id: PayoutId,
        teacher_id: UserId,
        amount_cents: i64,
    ) -> Result<bool, LedgerError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    purchases: HashMap<String, CoursePurchase>,
    payments: HashMap<String, PaymentState>,
    refunds: HashMap<String, i64>,
    disputes: HashMap<String, (String, i64)>,
    accounts: HashMap<String, AccountStatus>,
    payout_credits: HashMap<PayoutId, (UserId, i64)>,
    unavailable: Option<String>,
}

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPaymentLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (simulates an outage).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.write().unwrap().unavailable = reason.map(str::to_string);
    }

    pub fn purchases(&self) -> Vec<CoursePurchase> {
        self.state.read().unwrap().purchases.values().cloned().collect()
    }

    pub fn payment(&self, payment_intent_id: &str) -> Option<PaymentState> {
        self.state.read().unwrap().payments.get(payment_intent_id).cloned()
    }

    pub fn refunded(&self, charge_id: &str) -> i64 {
        self.state
            .read()
            .unwrap()
            .refunds
            .get(charge_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn dispute_count(&self) -> usize {
        self.state.read().unwrap().disputes.len()
    }

    pub fn account_status(&self, account_id: &str) -> Option<AccountStatus> {
        self.state.read().unwrap().accounts.get(account_id).copied()
    }

    pub fn payout_credit_count(&self) -> usize {
        self.state.read().unwrap().payout_credits.len()
    }

    /// Total credited to a teacher across all payouts.
    pub fn paid_out_total(&self, teacher_id: UserId) -> i64 {
        self.state
            .read()
            .unwrap()
            .payout_credits
            .values()
            .filter(|(teacher, _)| *teacher == teacher_id)
            .map(|(_, amount)| amount)
            .sum()
    }

    fn write<T>(&self, f: impl FnOnce(&mut LedgerState) -> T) -> Result<T, LedgerError> {
        let mut state = self.state.write().unwrap();
        if let Some(reason) = &state.unavailable {
            return Err(LedgerError::Unavailable(reason.clone()));
        }
        Ok(f(&mut state))
    }
}

impl PaymentLedger for InMemoryPaymentLedger {
    fn record_purchase(&self, purchase: &CoursePurchase) -> Result<bool, LedgerError> {
        self.write(|s| {
            if s.purchases.contains_key(&purchase.checkout_session_id) {
                return false;
            }
            s.purchases
                .insert(purchase.checkout_session_id.clone(), purchase.clone());
            true
        })
    }

    fn record_payment_succeeded(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<bool, LedgerError> {
        self.write(|s| {
            if matches!(
                s.payments.get(payment_intent_id),
                Some(PaymentState::Succeeded { .. })
            ) {
                return false;
            }
            s.payments.insert(
                payment_intent_id.to_string(),
                PaymentState::Succeeded {
                    amount_cents,
                    currency: currency.to_string(),
                },
            );
            true
        })
    }

    fn record_payment_failed(
        &self,
        payment_intent_id: &str,
        reason: &str,
    ) -> Result<bool, LedgerError> {
        self.write(|s| match s.payments.get(payment_intent_id) {
            // A late failure notice never downgrades a success.
            Some(PaymentState::Succeeded { .. }) => false,
            Some(PaymentState::Failed { reason: existing }) if existing == reason => false,
            _ => {
                s.payments.insert(
                    payment_intent_id.to_string(),
                    PaymentState::Failed {
                        reason: reason.to_string(),
                    },
                );
                true
            }
        })
    }

    fn record_refund(&self, charge_id: &str, amount_refunded: i64) -> Result<bool, LedgerError> {
        self.write(|s| {
            let current = s.refunds.entry(charge_id.to_string()).or_insert(0);
            if amount_refunded <= *current {
                return false;
            }
            *current = amount_refunded;
            true
        })
    }

    fn record_dispute(
        &self,
        dispute_id: &str,
        charge_id: &str,
        amount_cents: i64,
    ) -> Result<bool, LedgerError> {
        self.write(|s| {
            if s.disputes.contains_key(dispute_id) {
                return false;
            }
            s.disputes
                .insert(dispute_id.to_string(), (charge_id.to_string(), amount_cents));
            true
        })
    }

    fn update_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<bool, LedgerError> {
        self.write(|s| s.accounts.insert(account_id.to_string(), status) != Some(status))
    }

    fn credit_payout(
        &self,
        payout_id: PayoutId,
        teacher_id: UserId,
        amount_cents: i64,
    ) -> Result<bool, LedgerError> {
        self.write(|s| {
            if s.payout_credits.contains_key(&payout_id) {
                return false;
            }
            s.payout_credits.insert(payout_id, (teacher_id, amount_cents));
            true
        })
    }
}
