//! Payout submission seam.
//!
//! The provider's transfer API is reached through [`PayoutProcessor`]; the
//! retry service never talks to it directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use learnhub_core::PayoutId;
use learnhub_payments::{FailureCategory, Payout};

/// Provider acknowledgement of a (re)submitted payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReceipt {
    pub provider_payout_id: String,
}

/// Provider rejection. `category` is `None` when the provider gave no code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payout rejected: {reason}")]
pub struct ProcessorError {
    pub category: Option<FailureCategory>,
    pub reason: String,
}

impl ProcessorError {
    pub fn new(category: Option<FailureCategory>, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }

    /// Build from a provider failure code, classifying it.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        Self::new(Some(FailureCategory::from_failure_code(code)), message)
    }
}

pub trait PayoutProcessor: Send + Sync {
    /// Submit the payout again. Called once per retry attempt.
    fn retry_payout(&self, payout: &Payout) -> Result<PayoutReceipt, ProcessorError>;
}

/// Scriptable processor for tests and local runs.
///
/// Queued outcomes are consumed per payout; with nothing queued the payout is
/// accepted with a generated provider id.
#[derive(Debug, Default)]
pub struct SimulatedPayoutProcessor {
    scripted: Mutex<HashMap<PayoutId, VecDeque<Result<PayoutReceipt, ProcessorError>>>>,
    calls: Mutex<Vec<PayoutId>>,
}

impl SimulatedPayoutProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(
        &self,
        payout_id: PayoutId,
        outcome: Result<PayoutReceipt, ProcessorError>,
    ) {
        self.scripted
            .lock()
            .unwrap()
            .entry(payout_id)
            .or_default()
            .push_back(outcome);
    }

    pub fn fail_next(&self, payout_id: PayoutId, error: ProcessorError) {
        self.push_outcome(payout_id, Err(error));
    }

    /// Payout ids submitted so far, in call order.
    pub fn calls(&self) -> Vec<PayoutId> {
        self.calls.lock().unwrap().clone()
    }
}

impl PayoutProcessor for SimulatedPayoutProcessor {
    fn retry_payout(&self, payout: &Payout) -> Result<PayoutReceipt, ProcessorError> {
        self.calls.lock().unwrap().push(payout.id);
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&payout.id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(PayoutReceipt {
                provider_payout_id: format!("po_sim_{}", uuid::Uuid::now_v7().simple()),
            })
        })
    }
}
