//! Payout storage.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use learnhub_core::PayoutId;
use learnhub_payments::Payout;

use super::StoreError;

/// Payout store abstraction.
///
/// Retry bookkeeping is applied on the [`Payout`] value and written back with
/// `update`, so the metadata and attempt trail travel with the record.
pub trait PayoutStore: Send + Sync {
    fn insert(&self, payout: Payout) -> Result<PayoutId, StoreError>;

    fn get(&self, id: PayoutId) -> Result<Option<Payout>, StoreError>;

    fn find_by_provider_id(&self, provider_payout_id: &str) -> Result<Option<Payout>, StoreError>;

    /// Write back a modified payout. A stored payout that is already terminal
    /// is left as it is, so a stale copy cannot reopen it.
    fn update(&self, payout: &Payout) -> Result<(), StoreError>;

    /// `status == Failed && next_retry_at <= now && retry_count < max_retries`,
    /// earliest `next_retry_at` first.
    fn failed_due(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError>;
}

/// In-memory payout store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPayoutStore {
    payouts: RwLock<HashMap<PayoutId, Payout>>,
}

impl InMemoryPayoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayoutStore for InMemoryPayoutStore {
    fn insert(&self, payout: Payout) -> Result<PayoutId, StoreError> {
        let mut payouts = self.payouts.write().unwrap();
        if payouts.contains_key(&payout.id) {
            return Err(StoreError::AlreadyExists(payout.id.to_string()));
        }
        let id = payout.id;
        payouts.insert(id, payout);
        Ok(id)
    }

    fn get(&self, id: PayoutId) -> Result<Option<Payout>, StoreError> {
        Ok(self.payouts.read().unwrap().get(&id).cloned())
    }

    fn find_by_provider_id(&self, provider_payout_id: &str) -> Result<Option<Payout>, StoreError> {
        let payouts = self.payouts.read().unwrap();
        Ok(payouts
            .values()
            .find(|p| p.provider_payout_id.as_deref() == Some(provider_payout_id))
            .cloned())
    }

    fn update(&self, payout: &Payout) -> Result<(), StoreError> {
        let mut payouts = self.payouts.write().unwrap();
        let stored = payouts
            .get_mut(&payout.id)
            .ok_or(StoreError::PayoutNotFound(payout.id))?;
        if stored.is_terminal() {
            return Ok(());
        }
        *stored = payout.clone();
        Ok(())
    }

    fn failed_due(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError> {
        let payouts = self.payouts.read().unwrap();
        let mut due: Vec<_> = payouts.values().filter(|p| p.is_due(now)).cloned().collect();
        due.sort_by_key(|p| (p.next_retry_at, p.created_at));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use learnhub_core::UserId;
    use learnhub_payments::FailureCategory;

    fn failed_payout(due_at: DateTime<Utc>) -> Payout {
        let mut payout = Payout::new(UserId::new(), 10_000, "usd", due_at);
        payout.fail(None, "declined", Some(due_at), due_at);
        payout
    }

    #[test]
    fn failed_due_filters_and_orders() {
        let store = InMemoryPayoutStore::new();
        let now = Utc::now();

        let a = failed_payout(now - chrono::Duration::minutes(5));
        let b = failed_payout(now - chrono::Duration::minutes(30));
        let not_due = failed_payout(now + chrono::Duration::minutes(5));
        let mut exhausted = failed_payout(now - chrono::Duration::minutes(60));
        exhausted.retry_count = exhausted.max_retries;
        let mut permanent = Payout::new(UserId::new(), 1, "usd", now);
        permanent.fail(Some(FailureCategory::AccountClosed), "closed", None, now);

        let (a_id, b_id) = (a.id, b.id);
        for p in [a, b, not_due, exhausted, permanent] {
            store.insert(p).unwrap();
        }

        let due: Vec<_> = store.failed_due(now).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(due, vec![b_id, a_id]);
    }

    #[test]
    fn update_requires_existing_payout() {
        let store = InMemoryPayoutStore::new();
        let payout = failed_payout(Utc::now());
        assert!(matches!(store.update(&payout), Err(StoreError::PayoutNotFound(_))));
    }

    #[test]
    fn stale_copy_does_not_reopen_terminal_payout() {
        let store = InMemoryPayoutStore::new();
        let now = Utc::now();
        let mut payout = Payout::new(UserId::new(), 2_000, "usd", now);
        payout.mark_submitted("po_abc", now);
        let stale = payout.clone();
        store.insert(payout.clone()).unwrap();

        payout.mark_canceled(now);
        store.update(&payout).unwrap();

        let mut stale = stale;
        stale.fail(None, "late failure notice", Some(now), now);
        store.update(&stale).unwrap();

        let stored = store.get(payout.id).unwrap().unwrap();
        assert_eq!(stored.status, learnhub_payments::PayoutStatus::Canceled);
        assert_eq!(stored.next_retry_at, None);
    }

    #[test]
    fn find_by_provider_id() {
        let store = InMemoryPayoutStore::new();
        let now = Utc::now();
        let mut payout = Payout::new(UserId::new(), 2_000, "usd", now);
        payout.mark_submitted("po_abc", now);
        let id = store.insert(payout).unwrap();

        let found = store.find_by_provider_id("po_abc").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(store.find_by_provider_id("po_missing").unwrap().is_none());
    }
}
