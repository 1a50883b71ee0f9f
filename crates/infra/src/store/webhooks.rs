//! Webhook event storage.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use learnhub_core::WebhookEventId;
use learnhub_payments::WebhookEvent;

use super::StoreError;

/// Webhook event store abstraction.
///
/// The three write operations are the only state transitions the retry cycle
/// performs. Each is idempotent: applied to a terminal event it returns the
/// event unchanged.
pub trait WebhookEventStore: Send + Sync {
    /// Persist a newly received event. Duplicate provider ids are rejected.
    fn insert(&self, event: WebhookEvent) -> Result<WebhookEventId, StoreError>;

    fn get(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>, StoreError>;

    /// Events due for a retry at `now`, earliest `next_retry_at` first.
    fn pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Terminal success.
    fn mark_processed(
        &self,
        id: WebhookEventId,
        processing_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError>;

    /// Bump `retry_count`, set `next_retry_at`, append the failed attempt.
    fn schedule_retry(
        &self,
        id: WebhookEventId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError>;

    /// Terminal failure.
    fn mark_failed(
        &self,
        id: WebhookEventId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError>;
}

/// In-memory webhook store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWebhookEventStore {
    events: RwLock<HashMap<WebhookEventId, WebhookEvent>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: WebhookEventId, f: F) -> Result<WebhookEvent, StoreError>
    where
        F: FnOnce(&mut WebhookEvent),
    {
        let mut events = self.events.write().unwrap();
        let event = events.get_mut(&id).ok_or(StoreError::WebhookNotFound(id))?;
        f(event);
        Ok(event.clone())
    }
}

impl WebhookEventStore for InMemoryWebhookEventStore {
    fn insert(&self, event: WebhookEvent) -> Result<WebhookEventId, StoreError> {
        let mut events = self.events.write().unwrap();
        if events
            .values()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return Err(StoreError::AlreadyExists(event.provider_event_id));
        }
        let id = event.id;
        events.insert(id, event);
        Ok(id)
    }

    fn get(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.events.read().unwrap().get(&id).cloned())
    }

    fn pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError> {
        let events = self.events.read().unwrap();
        let mut due: Vec<_> = events.values().filter(|e| e.is_due(now)).cloned().collect();
        due.sort_by_key(|e| (e.next_retry_at, e.created_at));
        Ok(due)
    }

    fn mark_processed(
        &self,
        id: WebhookEventId,
        processing_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.mutate(id, |e| {
            e.mark_processed(now, processing_time);
        })
    }

    fn schedule_retry(
        &self,
        id: WebhookEventId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.mutate(id, |e| {
            e.schedule_retry(error, next_retry_at, now);
        })
    }

    fn mark_failed(
        &self,
        id: WebhookEventId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.mutate(id, |e| {
            e.mark_failed(reason, now);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use learnhub_payments::{WebhookSource, WebhookStatus};

    fn failed_event(provider_id: &str, due_at: DateTime<Utc>) -> WebhookEvent {
        let mut event = WebhookEvent::new(
            provider_id,
            WebhookSource::Payments,
            "payment_intent.succeeded",
            "{}",
            due_at,
        );
        event.record_initial_failure("boom", due_at);
        event
    }

    #[test]
    fn pending_retries_are_due_and_ordered() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();

        let later = failed_event("evt_later", now - chrono::Duration::minutes(1));
        let earlier = failed_event("evt_earlier", now - chrono::Duration::minutes(10));
        let future = failed_event("evt_future", now + chrono::Duration::minutes(10));
        store.insert(later).unwrap();
        store.insert(earlier).unwrap();
        store.insert(future).unwrap();

        let due = store.pending_retries(now).unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.provider_event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_earlier", "evt_later"]);
    }

    #[test]
    fn duplicate_provider_event_is_rejected() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();

        store.insert(failed_event("evt_dup", now)).unwrap();
        assert!(matches!(
            store.insert(failed_event("evt_dup", now)),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn transitions_are_idempotent_once_terminal() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let id = store.insert(failed_event("evt_1", now)).unwrap();

        let processed = store.mark_processed(id, Duration::from_millis(3), now).unwrap();
        assert_eq!(processed.status, WebhookStatus::Processed);

        let again = store.mark_failed(id, "late failure", now).unwrap();
        assert_eq!(again, processed);
        assert!(store.pending_retries(now).unwrap().is_empty());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = InMemoryWebhookEventStore::new();
        let id = WebhookEventId::new();
        assert!(matches!(
            store.mark_failed(id, "x", Utc::now()),
            Err(StoreError::WebhookNotFound(missing)) if missing == id
        ));
    }
}
