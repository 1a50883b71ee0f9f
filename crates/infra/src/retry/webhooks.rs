use std::sync::Arc;

use tracing::{error, info, warn};

use learnhub_payments::WebhookEvent;

use crate::audit::{AuditCategory, AuditLevel, AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::dispatch::{HandlerDispatch, HandlerResult};
use crate::store::WebhookEventStore;

use super::{
    RetryError, RetryJob, RetryOutcome, RetrySummary, budget_remains, exhausted_reason,
};

/// Re-dispatches failed webhook events from their stored raw payload.
pub struct WebhookRetryService {
    store: Arc<dyn WebhookEventStore>,
    dispatch: Arc<HandlerDispatch>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl WebhookRetryService {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        dispatch: Arc<HandlerDispatch>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatch,
            audit,
            clock,
        }
    }

    pub fn run_once(&self) -> Result<RetrySummary, RetryError> {
        let started_at = self.clock.now();
        let candidates = self
            .store
            .pending_retries(started_at)
            .map_err(RetryError::Candidates)?;
        info!(candidates = candidates.len(), "webhook retry cycle started");

        let mut summary = RetrySummary::default();
        for event in &candidates {
            summary.record(self.retry_event(event));
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rescheduled = summary.rescheduled,
            "webhook retry cycle finished"
        );
        self.audit
            .record(summary.audit_record(self.name(), self.clock.now()))
            .map_err(RetryError::Audit)?;
        Ok(summary)
    }

    fn retry_event(&self, event: &WebhookEvent) -> RetryOutcome {
        // The payload is parsed again on every attempt.
        match self.dispatch.dispatch_raw(event.source, &event.raw_payload) {
            Ok(result) if result.success => self.on_success(event, &result),
            Ok(result) => {
                let reason = result
                    .error
                    .unwrap_or_else(|| "handler reported failure".to_string());
                self.on_failure(event, &reason)
            }
            Err(err) => {
                warn!(
                    event_id = %event.id,
                    provider_event_id = %event.provider_event_id,
                    error = %err,
                    "webhook retry attempt errored"
                );
                self.on_failure(event, &err.to_string())
            }
        }
    }

    fn on_success(&self, event: &WebhookEvent, result: &HandlerResult) -> RetryOutcome {
        let now = self.clock.now();
        let updated = match self.store.mark_processed(event.id, result.processing_time, now) {
            Ok(updated) => updated,
            Err(err) => {
                error!(event_id = %event.id, error = %err, "failed to mark webhook processed");
                return RetryOutcome::Rescheduled;
            }
        };

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = updated.retry_count,
            "webhook retry succeeded"
        );
        self.audit_event(
            AuditRecord::new(
                AuditCategory::Webhook,
                AuditLevel::Info,
                format!("Webhook {} processed on retry", event.event_type),
                now,
            )
            .with("webhookEventId", event.id)
            .with("providerEventId", &event.provider_event_id)
            .with("attemptCount", updated.retry_count)
            .with("processingTimeMs", result.processing_time.as_millis() as u64)
            .with("affectedUserId", result.affected_user_id)
            .with("affectedUserType", result.affected_user_type)
            .with("relatedResourceIds", &result.related_resource_ids),
        );
        RetryOutcome::Succeeded
    }

    fn on_failure(&self, event: &WebhookEvent, reason: &str) -> RetryOutcome {
        let now = self.clock.now();

        if budget_remains(event.retry_count, event.max_retries) {
            let next_retry_at = event
                .retry_config
                .next_retry_at(event.retry_count, now, &mut rand::rng());
            return match self.store.schedule_retry(event.id, reason, next_retry_at, now) {
                Ok(updated) => {
                    info!(
                        event_id = %event.id,
                        retry_count = updated.retry_count,
                        next_retry_at = %next_retry_at,
                        "webhook retry rescheduled"
                    );
                    self.audit_event(
                        AuditRecord::new(
                            AuditCategory::Webhook,
                            AuditLevel::Warning,
                            format!("Webhook {} retry failed", event.event_type),
                            now,
                        )
                        .with("webhookEventId", event.id)
                        .with("attemptCount", updated.retry_count)
                        .with("error", reason)
                        .with("nextRetryAt", next_retry_at),
                    );
                    RetryOutcome::Rescheduled
                }
                Err(err) => {
                    error!(event_id = %event.id, error = %err, "failed to reschedule webhook");
                    RetryOutcome::Rescheduled
                }
            };
        }

        let final_reason = exhausted_reason(reason);
        match self.store.mark_failed(event.id, &final_reason, now) {
            Ok(updated) => {
                error!(
                    event_id = %event.id,
                    provider_event_id = %event.provider_event_id,
                    retry_count = updated.retry_count,
                    "webhook permanently failed"
                );
                self.audit_event(
                    AuditRecord::new(
                        AuditCategory::Webhook,
                        AuditLevel::Critical,
                        format!("Webhook {} permanently failed", event.event_type),
                        now,
                    )
                    .with("webhookEventId", event.id)
                    .with("providerEventId", &event.provider_event_id)
                    .with("attemptCount", updated.retry_count)
                    .with("reason", &final_reason),
                );
                RetryOutcome::Failed
            }
            Err(err) => {
                error!(event_id = %event.id, error = %err, "failed to mark webhook failed");
                RetryOutcome::Rescheduled
            }
        }
    }

    fn audit_event(&self, record: AuditRecord) {
        if let Err(err) = self.audit.record(record) {
            warn!(error = %err, "failed to write webhook audit record");
        }
    }
}

impl RetryJob for WebhookRetryService {
    fn name(&self) -> &'static str {
        "webhook-retry"
    }

    fn run_once(&self) -> Result<RetrySummary, RetryError> {
        WebhookRetryService::run_once(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use learnhub_payments::{WebhookSource, WebhookStatus};

    use crate::audit::InMemoryAuditSink;
    use crate::clock::FixedClock;
    use crate::ledger::InMemoryPaymentLedger;
    use crate::store::{InMemoryPayoutStore, InMemoryWebhookEventStore};

    fn service() -> (
        WebhookRetryService,
        Arc<InMemoryWebhookEventStore>,
        Arc<InMemoryAuditSink>,
    ) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(InMemoryWebhookEventStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let dispatch = Arc::new(HandlerDispatch::new(
            Arc::new(InMemoryPayoutStore::new()),
            Arc::new(InMemoryPaymentLedger::new()),
            audit.clone(),
            clock.clone(),
        ));
        let service = WebhookRetryService::new(store.clone(), dispatch, audit.clone(), clock);
        (service, store, audit)
    }

    fn failed_event(provider_id: &str, raw: String) -> WebhookEvent {
        let now = Utc::now() - chrono::Duration::minutes(1);
        let mut event = WebhookEvent::new(provider_id, WebhookSource::Payments, "x", raw, now);
        event.record_initial_failure("first delivery failed", now);
        event
    }

    #[test]
    fn successful_retry_marks_processed_and_audits() {
        let (service, store, audit) = service();
        let raw = json!({"id": "evt_1", "type": "invoice.created", "data": {"object": {}}});
        let id = store.insert(failed_event("evt_1", raw.to_string())).unwrap();

        let summary = service.run_once().unwrap();
        assert_eq!(summary.succeeded, 1);

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Processed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(audit.by_level(AuditLevel::Info).len(), 2);
    }

    #[test]
    fn unparsable_payload_is_rescheduled_with_backoff() {
        let (service, store, _audit) = service();
        let id = store
            .insert(failed_event("evt_bad", "not json".to_string()))
            .unwrap();

        let summary = service.run_once().unwrap();
        assert_eq!(summary.rescheduled, 1);

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.unwrap() > Utc::now());
        assert!(store.pending_retries(Utc::now()).unwrap().is_empty());
    }
}
