//! Teacher payouts and their retry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use learnhub_core::{DomainResult, PayoutId, UserId};

use crate::attempt::AttemptRecord;
use crate::backoff::RetryConfig;
use crate::failure::FailureCategory;

/// Payout lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    /// Accepted by the provider, waiting for `payout.paid`.
    Scheduled,
    Paid,
    /// Retried while `next_retry_at` is set; terminal otherwise.
    Failed,
    Canceled,
}

impl PayoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Scheduled => "scheduled",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "scheduled" => Some(PayoutStatus::Scheduled),
            "paid" => Some(PayoutStatus::Paid),
            "failed" => Some(PayoutStatus::Failed),
            "canceled" => Some(PayoutStatus::Canceled),
            _ => None,
        }
    }
}

/// A transfer of teacher earnings to their connected account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: PayoutId,
    pub teacher_id: UserId,
    /// Smallest currency unit (e.g. cents).
    pub amount_cents: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub provider_payout_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    pub failure_category: Option<FailureCategory>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Inline retry metadata (`lastRetryAt`, `lastRetryError`, `permanentFailure`).
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payout {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(
        teacher_id: UserId,
        amount_cents: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PayoutId::new(),
            teacher_id,
            amount_cents,
            currency: currency.into(),
            status: PayoutStatus::Pending,
            provider_payout_id: None,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            retry_config: RetryConfig::default(),
            failure_category: None,
            failure_reason: None,
            attempts: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            paid_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Replace the backoff configuration. Rejects configs that fail validation.
    pub fn with_retry_config(mut self, config: RetryConfig) -> DomainResult<Self> {
        config.validate()?;
        self.retry_config = config;
        Ok(self)
    }

    pub fn is_terminal(&self) -> bool {
        match self.status {
            PayoutStatus::Paid | PayoutStatus::Canceled => true,
            PayoutStatus::Failed => self.next_retry_at.is_none(),
            PayoutStatus::Pending | PayoutStatus::Scheduled => false,
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `status == Failed && next_retry_at <= now && retry_count < max_retries`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PayoutStatus::Failed
            && self.has_retry_budget()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    fn next_attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    fn touch_retry_metadata(&mut self, now: DateTime<Utc>, error: Option<&str>) {
        self.metadata
            .insert("lastRetryAt".to_string(), JsonValue::String(now.to_rfc3339()));
        match error {
            Some(e) => {
                self.metadata
                    .insert("lastRetryError".to_string(), JsonValue::String(e.to_string()));
            }
            None => {
                self.metadata.remove("lastRetryError");
            }
        }
    }

    /// Provider accepted the payout.
    pub fn mark_submitted(
        &mut self,
        provider_payout_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PayoutStatus::Scheduled;
        self.provider_payout_id = Some(provider_payout_id.into());
        self.updated_at = now;
        true
    }

    /// A failure reported outside the retry cycle (initiator or `payout.failed`).
    ///
    /// Does not consume a retry. `next_retry_at` is `None` when the category
    /// rules out retrying, which makes the failure terminal.
    pub fn fail(
        &mut self,
        category: Option<FailureCategory>,
        reason: impl Into<String>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PayoutStatus::Failed;
        self.failure_category = category;
        self.failure_reason = Some(reason.into());
        self.next_retry_at = next_retry_at;
        if next_retry_at.is_none() {
            self.metadata
                .insert("permanentFailure".to_string(), JsonValue::Bool(true));
        }
        self.updated_at = now;
        true
    }

    /// Successful retry attempt: the provider accepted a new payout.
    pub fn mark_scheduled(
        &mut self,
        provider_payout_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.attempts
            .push(AttemptRecord::succeeded(self.next_attempt_number(), now));
        self.retry_count += 1;
        self.status = PayoutStatus::Scheduled;
        self.provider_payout_id = Some(provider_payout_id.into());
        self.next_retry_at = None;
        self.failure_category = None;
        self.failure_reason = None;
        self.touch_retry_metadata(now, None);
        self.updated_at = now;
        true
    }

    /// Failed retry attempt with budget remaining.
    pub fn schedule_retry(
        &mut self,
        category: Option<FailureCategory>,
        reason: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.attempts.push(AttemptRecord::failed(
            self.next_attempt_number(),
            now,
            reason.clone(),
        ));
        self.retry_count += 1;
        self.status = PayoutStatus::Failed;
        self.failure_category = category;
        self.touch_retry_metadata(now, Some(&reason));
        self.failure_reason = Some(reason);
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now;
        true
    }

    /// Failed retry attempt that ends retrying (budget spent or permanent category).
    pub fn record_final_failure(
        &mut self,
        category: Option<FailureCategory>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.attempts.push(AttemptRecord::failed(
            self.next_attempt_number(),
            now,
            reason.clone(),
        ));
        self.retry_count += 1;
        self.status = PayoutStatus::Failed;
        self.failure_category = category;
        self.touch_retry_metadata(now, Some(&reason));
        self.metadata
            .insert("permanentFailure".to_string(), JsonValue::Bool(true));
        self.failure_reason = Some(reason);
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    /// Stop retrying without an attempt: the stored category is permanent.
    ///
    /// `retry_count` and `attempts` are untouched.
    pub fn suppress_retries(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PayoutStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.metadata
            .insert("permanentFailure".to_string(), JsonValue::Bool(true));
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    /// Provider confirmed the funds arrived. No-op once terminal.
    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PayoutStatus::Paid;
        self.next_retry_at = None;
        self.failure_category = None;
        self.failure_reason = None;
        self.paid_at = Some(now);
        self.updated_at = now;
        true
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = PayoutStatus::Canceled;
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }
}
