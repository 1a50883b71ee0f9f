//! Retry cycles for failed webhook events and payouts.
//!
//! A cycle loads every due item, gives each exactly one attempt, and writes
//! back one of three outcomes. Items are processed sequentially; an error on
//! one item is turned into a retriable failure for that item and never aborts
//! the rest of the batch.
//!
//! There is no claim/lease step: two overlapping cycles (or two worker
//! replicas) can pick up the same due item.

mod payouts;
mod webhooks;

use serde::Serialize;

use crate::audit::{AuditCategory, AuditError, AuditLevel, AuditRecord};
use crate::store::StoreError;

pub use payouts::PayoutRetryService;
pub use webhooks::WebhookRetryService;

/// Result of one attempt on one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    /// Failed with budget left, or the attempt errored before a decision was stored.
    Rescheduled,
    /// Terminal failure.
    Failed,
}

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

impl RetrySummary {
    pub fn record(&mut self, outcome: RetryOutcome) {
        self.processed += 1;
        match outcome {
            RetryOutcome::Succeeded => self.succeeded += 1,
            RetryOutcome::Rescheduled => self.rescheduled += 1,
            RetryOutcome::Failed => self.failed += 1,
        }
    }

    fn audit_record(&self, job: &str, occurred_at: chrono::DateTime<chrono::Utc>) -> AuditRecord {
        AuditRecord::new(
            AuditCategory::RetryCycle,
            AuditLevel::Info,
            format!("{job} cycle finished"),
            occurred_at,
        )
        .with("job", job)
        .with("processed", self.processed)
        .with("succeeded", self.succeeded)
        .with("failed", self.failed)
        .with("rescheduled", self.rescheduled)
    }
}

/// Cycle-level failures. Per-item errors never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("failed to load retry candidates: {0}")]
    Candidates(#[source] StoreError),
    #[error("failed to record cycle summary: {0}")]
    Audit(#[source] AuditError),
}

/// A retry cycle the scheduler can run.
pub trait RetryJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_once(&self) -> Result<RetrySummary, RetryError>;
}

/// Reason written on an item whose retry budget ran out.
pub(crate) fn exhausted_reason(error: &str) -> String {
    format!("Max retries exceeded: {error}")
}

/// `retry_count + 1 < max_retries`: another attempt fits after this one.
pub(crate) fn budget_remains(retry_count: u32, max_retries: u32) -> bool {
    retry_count.saturating_add(1) < max_retries
}
