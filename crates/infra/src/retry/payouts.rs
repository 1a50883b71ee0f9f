use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use learnhub_payments::{FailureCategory, Payout};

use crate::audit::{AuditCategory, AuditLevel, AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::processor::{PayoutProcessor, ProcessorError};
use crate::store::PayoutStore;

use super::{
    RetryError, RetryJob, RetryOutcome, RetrySummary, budget_remains, exhausted_reason,
};

/// Resubmits failed payouts whose retry time has come.
///
/// Retry bookkeeping lives inline on the payout (`attempts` and `metadata`);
/// the audit sink only sees successes and terminal failures.
pub struct PayoutRetryService {
    store: Arc<dyn PayoutStore>,
    processor: Arc<dyn PayoutProcessor>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl PayoutRetryService {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        processor: Arc<dyn PayoutProcessor>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            processor,
            audit,
            clock,
        }
    }

    pub fn run_once(&self) -> Result<RetrySummary, RetryError> {
        let started_at = self.clock.now();
        let candidates = self
            .store
            .failed_due(started_at)
            .map_err(RetryError::Candidates)?;
        info!(candidates = candidates.len(), "payout retry cycle started");

        let mut summary = RetrySummary::default();
        for payout in candidates {
            summary.record(self.retry_payout(payout));
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rescheduled = summary.rescheduled,
            "payout retry cycle finished"
        );
        self.audit
            .record(summary.audit_record(self.name(), self.clock.now()))
            .map_err(RetryError::Audit)?;
        Ok(summary)
    }

    fn retry_payout(&self, mut payout: Payout) -> RetryOutcome {
        let now = self.clock.now();

        // Permanent categories end here: no attempt, no backoff, retry_count untouched.
        if let Some(category) = payout.failure_category.filter(|c| !c.is_retryable()) {
            payout.suppress_retries(format!("Non-retryable failure: {category}"), now);
            return self.persist_terminal(payout, now);
        }

        match self.processor.retry_payout(&payout) {
            Ok(receipt) => {
                payout.mark_scheduled(receipt.provider_payout_id.clone(), now);
                if let Err(err) = self.store.update(&payout) {
                    // The provider accepted it; a later cycle may submit again.
                    error!(
                        payout_id = %payout.id,
                        error = %err,
                        "failed to store scheduled payout"
                    );
                    return RetryOutcome::Rescheduled;
                }
                info!(
                    payout_id = %payout.id,
                    provider_payout_id = %receipt.provider_payout_id,
                    attempt = payout.retry_count,
                    "payout retry succeeded"
                );
                self.audit_payout(
                    AuditRecord::new(
                        AuditCategory::Payout,
                        AuditLevel::Info,
                        "Payout resubmitted on retry",
                        now,
                    )
                    .with("payoutId", payout.id)
                    .with("teacherId", payout.teacher_id)
                    .with("providerPayoutId", &receipt.provider_payout_id)
                    .with("attemptCount", payout.retry_count)
                    .with("amountCents", payout.amount_cents),
                );
                RetryOutcome::Succeeded
            }
            Err(err) => self.on_failure(payout, err, now),
        }
    }

    fn on_failure(
        &self,
        mut payout: Payout,
        err: ProcessorError,
        now: DateTime<Utc>,
    ) -> RetryOutcome {
        let ProcessorError { category, reason } = err;
        warn!(
            payout_id = %payout.id,
            category = category.map(FailureCategory::as_str).unwrap_or("none"),
            reason = %reason,
            "payout retry attempt failed"
        );

        if let Some(permanent) = category.filter(|c| !c.is_retryable()) {
            payout.record_final_failure(
                category,
                format!("Non-retryable failure: {permanent}: {reason}"),
                now,
            );
            return self.persist_terminal(payout, now);
        }

        if budget_remains(payout.retry_count, payout.max_retries) {
            let next_retry_at = payout
                .retry_config
                .next_retry_at(payout.retry_count, now, &mut rand::rng());
            payout.schedule_retry(category, reason, next_retry_at, now);
            if let Err(err) = self.store.update(&payout) {
                error!(payout_id = %payout.id, error = %err, "failed to reschedule payout");
            } else {
                info!(
                    payout_id = %payout.id,
                    retry_count = payout.retry_count,
                    next_retry_at = %next_retry_at,
                    "payout retry rescheduled"
                );
            }
            return RetryOutcome::Rescheduled;
        }

        payout.record_final_failure(category, exhausted_reason(&reason), now);
        self.persist_terminal(payout, now)
    }

    fn persist_terminal(&self, payout: Payout, now: DateTime<Utc>) -> RetryOutcome {
        if let Err(err) = self.store.update(&payout) {
            error!(payout_id = %payout.id, error = %err, "failed to store terminal payout failure");
            return RetryOutcome::Rescheduled;
        }

        let reason = payout.failure_reason.clone().unwrap_or_default();
        error!(
            payout_id = %payout.id,
            retry_count = payout.retry_count,
            reason = %reason,
            "payout permanently failed"
        );
        self.audit_payout(
            AuditRecord::new(
                AuditCategory::Payout,
                AuditLevel::Critical,
                "Payout permanently failed",
                now,
            )
            .with("payoutId", payout.id)
            .with("teacherId", payout.teacher_id)
            .with("attemptCount", payout.retry_count)
            .with("failureCategory", payout.failure_category)
            .with("reason", &reason),
        );
        RetryOutcome::Failed
    }

    fn audit_payout(&self, record: AuditRecord) {
        if let Err(err) = self.audit.record(record) {
            warn!(error = %err, "failed to write payout audit record");
        }
    }
}

impl RetryJob for PayoutRetryService {
    fn name(&self) -> &'static str {
        "payout-retry"
    }

    fn run_once(&self) -> Result<RetrySummary, RetryError> {
        PayoutRetryService::run_once(self)
    }
}
