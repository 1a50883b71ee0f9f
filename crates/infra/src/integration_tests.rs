//! Integration tests for the retry pipeline.
//!
//! Tests: Store → RetryService → HandlerDispatch / PayoutProcessor → Store + Ledger + Audit
//!
//! Verifies:
//! - Retry budgets terminate after exactly `max_retries` attempts
//! - Non-retryable payouts stop without consuming an attempt
//! - One failing item never aborts the rest of a batch
//! - Re-dispatching an already applied event has no second effect

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use learnhub_core::{PayoutId, UserId};
    use learnhub_payments::{
        FailureCategory, PaymentEvent, Payout, PayoutStatus, WebhookEvent, WebhookSource,
        WebhookStatus,
    };

    use crate::audit::{AuditLevel, InMemoryAuditSink};
    use crate::clock::FixedClock;
    use crate::dispatch::HandlerDispatch;
    use crate::ledger::InMemoryPaymentLedger;
    use crate::processor::{ProcessorError, SimulatedPayoutProcessor};
    use crate::retry::{PayoutRetryService, RetryError, RetrySummary, WebhookRetryService};
    use crate::store::{
        InMemoryPayoutStore, InMemoryWebhookEventStore, PayoutStore, StoreError, WebhookEventStore,
    };

    struct Harness {
        clock: Arc<FixedClock>,
        webhooks: Arc<InMemoryWebhookEventStore>,
        payouts: Arc<InMemoryPayoutStore>,
        ledger: Arc<InMemoryPaymentLedger>,
        processor: Arc<SimulatedPayoutProcessor>,
        audit: Arc<InMemoryAuditSink>,
        dispatch: Arc<HandlerDispatch>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(FixedClock::new(Utc::now()));
            let payouts = Arc::new(InMemoryPayoutStore::new());
            let ledger = Arc::new(InMemoryPaymentLedger::new());
            let audit = Arc::new(InMemoryAuditSink::new());
            let dispatch = Arc::new(HandlerDispatch::new(
                payouts.clone(),
                ledger.clone(),
                audit.clone(),
                clock.clone(),
            ));
            Self {
                clock,
                webhooks: Arc::new(InMemoryWebhookEventStore::new()),
                payouts,
                ledger,
                processor: Arc::new(SimulatedPayoutProcessor::new()),
                audit,
                dispatch,
            }
        }

        fn now(&self) -> DateTime<Utc> {
            use crate::clock::Clock;
            self.clock.now()
        }

        fn webhook_service(&self) -> WebhookRetryService {
            WebhookRetryService::new(
                self.webhooks.clone(),
                self.dispatch.clone(),
                self.audit.clone(),
                self.clock.clone(),
            )
        }

        fn payout_service(&self) -> PayoutRetryService {
            self.payout_service_with(self.payouts.clone())
        }

        fn payout_service_with(&self, store: Arc<dyn PayoutStore>) -> PayoutRetryService {
            PayoutRetryService::new(
                store,
                self.processor.clone(),
                self.audit.clone(),
                self.clock.clone(),
            )
        }

        /// Past the largest default backoff (1h cap + 10% jitter).
        fn advance_past_backoff(&self) {
            self.clock.advance(Duration::hours(2));
        }

        fn failed_webhook(
            &self,
            provider_id: &str,
            source: WebhookSource,
            raw: String,
        ) -> WebhookEvent {
            let now = self.now();
            let mut event = WebhookEvent::new(provider_id, source, "test", raw, now);
            event.record_initial_failure("first delivery failed", now);
            event
        }

        fn due_payout(&self, category: Option<FailureCategory>) -> Payout {
            let now = self.now();
            let mut payout = Payout::new(UserId::new(), 15_000, "usd", now);
            payout.mark_submitted("po_original", now);
            payout.fail(category, "initial failure", Some(now), now);
            payout
        }
    }

    fn envelope(id: &str, event_type: &str, object: serde_json::Value) -> String {
        json!({ "id": id, "type": event_type, "data": { "object": object } }).to_string()
    }

    fn payout_paid_payload(provider_id: &str, payout_id: PayoutId) -> String {
        envelope(
            "evt_paid",
            "payout.paid",
            json!({
                "id": provider_id,
                "amount": 15_000,
                "currency": "usd",
                "metadata": { "payoutId": payout_id.to_string() }
            }),
        )
    }

    // ---------------------------------------------------------------------
    // Retry budget termination
    // ---------------------------------------------------------------------

    #[test]
    fn webhook_reaches_terminal_failure_after_exactly_max_retries() {
        let h = Harness::new();
        let service = h.webhook_service();

        // payout.paid for a payout that does not exist: the handler fails every time.
        let raw = payout_paid_payload("po_ghost", PayoutId::new());
        let event = h
            .failed_webhook("evt_ghost", WebhookSource::Connect, raw)
            .with_max_retries(3);
        let id = h.webhooks.insert(event).unwrap();

        for expected_retry_count in 1..=3u32 {
            let summary = service.run_once().unwrap();
            assert_eq!(summary.processed, 1);

            let stored = h.webhooks.get(id).unwrap().unwrap();
            assert_eq!(stored.retry_count, expected_retry_count);
            assert_eq!(stored.attempts.len() as u32, expected_retry_count);
            h.advance_past_backoff();
        }

        let stored = h.webhooks.get(id).unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Failed);
        assert!(stored.next_retry_at.is_none());
        assert!(stored.failure_reason.unwrap().contains("Max retries exceeded"));

        // Never selected again.
        assert_eq!(service.run_once().unwrap(), RetrySummary::default());
        assert_eq!(h.audit.by_level(AuditLevel::Critical).len(), 1);
    }

    #[test]
    fn payout_reaches_terminal_failure_after_exactly_max_retries() {
        let h = Harness::new();
        let service = h.payout_service();

        let payout = h.due_payout(None);
        for _ in 0..3 {
            h.processor
                .fail_next(payout.id, ProcessorError::new(None, "provider timeout"));
        }
        let id = h.payouts.insert(payout).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(service.run_once().unwrap());
            h.advance_past_backoff();
        }
        assert_eq!(outcomes[0].rescheduled, 1);
        assert_eq!(outcomes[1].rescheduled, 1);
        assert_eq!(outcomes[2].failed, 1);

        let stored = h.payouts.get(id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert!(stored.is_terminal());
        assert_eq!(service.run_once().unwrap().processed, 0);
        assert_eq!(h.processor.calls().len(), 3);
    }

    #[test]
    fn payout_on_last_retry_fails_with_exhausted_reason() {
        let h = Harness::new();
        let mut payout = h.due_payout(None);
        payout.retry_count = 2;
        payout.max_retries = 3;
        h.processor
            .fail_next(payout.id, ProcessorError::new(None, "declined again"));
        let id = h.payouts.insert(payout).unwrap();

        let summary = h.payout_service().run_once().unwrap();
        assert_eq!(summary.failed, 1);

        let stored = h.payouts.get(id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert!(stored.next_retry_at.is_none());
        assert!(stored
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("Max retries exceeded"));
    }

    // ---------------------------------------------------------------------
    // Non-retryable short-circuit
    // ---------------------------------------------------------------------

    #[test]
    fn non_retryable_payout_is_terminal_on_first_encounter() {
        let h = Harness::new();
        let mut payout = h.due_payout(Some(FailureCategory::AccountClosed));
        payout.retry_count = 1;
        let attempts_before = payout.attempts.len();
        let id = h.payouts.insert(payout).unwrap();

        let service = h.payout_service();
        let summary = service.run_once().unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);

        let stored = h.payouts.get(id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.attempts.len(), attempts_before);
        assert!(stored.next_retry_at.is_none());
        assert!(stored
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("Non-retryable failure"));
        assert!(h.processor.calls().is_empty());

        h.advance_past_backoff();
        assert_eq!(service.run_once().unwrap().processed, 0);
    }

    // ---------------------------------------------------------------------
    // Batch isolation
    // ---------------------------------------------------------------------

    #[test]
    fn one_broken_webhook_does_not_abort_the_batch() {
        let h = Harness::new();
        for i in 0..4 {
            let raw = envelope(
                &format!("evt_{i}"),
                "customer.updated",
                json!({ "id": format!("cus_{i}") }),
            );
            h.webhooks
                .insert(h.failed_webhook(&format!("evt_{i}"), WebhookSource::Payments, raw))
                .unwrap();
        }
        let broken = h
            .webhooks
            .insert(h.failed_webhook("evt_broken", WebhookSource::Payments, "{\"id\":".into()))
            .unwrap();

        let summary = h.webhook_service().run_once().unwrap();
        assert_eq!(
            summary,
            RetrySummary {
                processed: 5,
                succeeded: 4,
                failed: 0,
                rescheduled: 1
            }
        );

        let stored = h.webhooks.get(broken).unwrap().unwrap();
        assert_eq!(stored.status, WebhookStatus::Failed);
        assert!(stored.next_retry_at.is_some());
    }

    /// Payout store whose writes fail for one payout.
    struct FlakyPayoutStore {
        inner: Arc<InMemoryPayoutStore>,
        broken: PayoutId,
    }

    impl PayoutStore for FlakyPayoutStore {
        fn insert(&self, payout: Payout) -> Result<PayoutId, StoreError> {
            self.inner.insert(payout)
        }

        fn get(&self, id: PayoutId) -> Result<Option<Payout>, StoreError> {
            self.inner.get(id)
        }

        fn find_by_provider_id(
            &self,
            provider_payout_id: &str,
        ) -> Result<Option<Payout>, StoreError> {
            self.inner.find_by_provider_id(provider_payout_id)
        }

        fn update(&self, payout: &Payout) -> Result<(), StoreError> {
            if payout.id == self.broken {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.inner.update(payout)
        }

        fn failed_due(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError> {
            self.inner.failed_due(now)
        }
    }

    #[test]
    fn payout_store_error_is_isolated_to_its_item() {
        let h = Harness::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(h.payouts.insert(h.due_payout(None)).unwrap());
        }
        let flaky = Arc::new(FlakyPayoutStore {
            inner: h.payouts.clone(),
            broken: ids[2],
        });

        let summary = h.payout_service_with(flaky).run_once().unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.rescheduled, 1);

        // The broken payout is untouched and still due.
        let broken = h.payouts.get(ids[2]).unwrap().unwrap();
        assert_eq!(broken.status, PayoutStatus::Failed);
        assert_eq!(broken.retry_count, 0);
        assert!(broken.is_due(h.now()));
    }

    // ---------------------------------------------------------------------
    // Idempotent re-dispatch
    // ---------------------------------------------------------------------

    #[test]
    fn payout_paid_redelivery_credits_once() {
        let h = Harness::new();
        let now = h.now();
        let mut payout = Payout::new(UserId::new(), 15_000, "usd", now);
        payout.mark_submitted("po_live", now);
        let teacher = payout.teacher_id;
        let payout_id = h.payouts.insert(payout).unwrap();

        let raw = payout_paid_payload("po_live", payout_id);

        // First delivery applied the effect but the event was left in the retry queue.
        let first = h.dispatch.dispatch_raw(WebhookSource::Connect, &raw).unwrap();
        assert!(first.success);
        let event_id = h
            .webhooks
            .insert(h.failed_webhook("evt_paid", WebhookSource::Connect, raw.clone()))
            .unwrap();

        let summary = h.webhook_service().run_once().unwrap();
        assert_eq!(summary.succeeded, 1);

        let again = h
            .dispatch
            .dispatch(
                WebhookSource::Connect,
                &PaymentEvent::parse(WebhookSource::Connect, &raw).unwrap(),
            )
            .unwrap();
        assert!(again.success);

        assert_eq!(h.ledger.payout_credit_count(), 1);
        assert_eq!(h.ledger.paid_out_total(teacher), 15_000);
        assert_eq!(h.payouts.get(payout_id).unwrap().unwrap().status, PayoutStatus::Paid);
        assert_eq!(
            h.webhooks.get(event_id).unwrap().unwrap().status,
            WebhookStatus::Processed
        );
    }

    #[test]
    fn late_payout_paid_does_not_revive_terminal_failure() {
        let h = Harness::new();
        let now = h.now();
        let mut payout = Payout::new(UserId::new(), 15_000, "usd", now);
        payout.mark_submitted("po_x", now);
        payout.fail(Some(FailureCategory::AccountClosed), "closed", None, now);
        let payout_id = h.payouts.insert(payout.clone()).unwrap();

        let raw = payout_paid_payload("po_x", payout_id);
        let event_id = h
            .webhooks
            .insert(h.failed_webhook("evt_paid", WebhookSource::Connect, raw))
            .unwrap();

        let summary = h.webhook_service().run_once().unwrap();
        assert_eq!(summary.succeeded, 1);

        assert_eq!(h.payouts.get(payout_id).unwrap().unwrap(), payout);
        assert_eq!(h.ledger.payout_credit_count(), 0);
        assert_eq!(h.ledger.paid_out_total(payout.teacher_id), 0);
        assert_eq!(
            h.webhooks.get(event_id).unwrap().unwrap().status,
            WebhookStatus::Processed
        );
    }

    // ---------------------------------------------------------------------
    // Unknown-type no-op
    // ---------------------------------------------------------------------

    #[test]
    fn unknown_event_type_mutates_nothing() {
        let h = Harness::new();
        let payout = h.due_payout(None);
        let payout_id = h.payouts.insert(payout.clone()).unwrap();

        let raw = envelope(
            "evt_new",
            "treasury.outbound_transfer.created",
            json!({ "id": "obt_1", "metadata": { "payoutId": payout_id.to_string() } }),
        );
        let result = h.dispatch.dispatch_raw(WebhookSource::Connect, &raw).unwrap();

        assert!(result.success);
        assert_eq!(result.processing_time, std::time::Duration::ZERO);
        assert_eq!(h.payouts.get(payout_id).unwrap().unwrap(), payout);
        assert_eq!(h.ledger.payout_credit_count(), 0);
        assert!(h.ledger.purchases().is_empty());
    }

    // ---------------------------------------------------------------------
    // Cycle-level failures
    // ---------------------------------------------------------------------

    #[test]
    fn summary_audit_failure_fails_the_cycle_after_items_are_written() {
        let h = Harness::new();
        let id = h.payouts.insert(h.due_payout(None)).unwrap();
        h.audit.set_unavailable(true);

        let result = h.payout_service().run_once();
        assert!(matches!(result, Err(RetryError::Audit(_))));

        // Item state was still committed.
        let stored = h.payouts.get(id).unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Scheduled);
    }

    /// Store that cannot list candidates.
    struct UnreachableWebhookStore;

    impl WebhookEventStore for UnreachableWebhookStore {
        fn insert(
            &self,
            _event: WebhookEvent,
        ) -> Result<learnhub_core::WebhookEventId, StoreError> {
            Err(StoreError::Storage("unreachable".into()))
        }

        fn get(
            &self,
            _id: learnhub_core::WebhookEventId,
        ) -> Result<Option<WebhookEvent>, StoreError> {
            Err(StoreError::Storage("unreachable".into()))
        }

        fn pending_retries(&self, _now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError> {
            Err(StoreError::Storage("unreachable".into()))
        }

        fn mark_processed(
            &self,
            id: learnhub_core::WebhookEventId,
            _processing_time: std::time::Duration,
            _now: DateTime<Utc>,
        ) -> Result<WebhookEvent, StoreError> {
            Err(StoreError::WebhookNotFound(id))
        }

        fn schedule_retry(
            &self,
            id: learnhub_core::WebhookEventId,
            _error: &str,
            _next_retry_at: DateTime<Utc>,
            _now: DateTime<Utc>,
        ) -> Result<WebhookEvent, StoreError> {
            Err(StoreError::WebhookNotFound(id))
        }

        fn mark_failed(
            &self,
            id: learnhub_core::WebhookEventId,
            _reason: &str,
            _now: DateTime<Utc>,
        ) -> Result<WebhookEvent, StoreError> {
            Err(StoreError::WebhookNotFound(id))
        }
    }

    #[test]
    fn candidate_load_failure_propagates() {
        let h = Harness::new();
        let service = WebhookRetryService::new(
            Arc::new(UnreachableWebhookStore),
            h.dispatch.clone(),
            h.audit.clone(),
            h.clock.clone(),
        );

        assert!(matches!(service.run_once(), Err(RetryError::Candidates(_))));
        assert!(h.audit.all().is_empty());
    }
}
