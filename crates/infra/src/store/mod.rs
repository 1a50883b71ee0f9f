//! Persistence boundary for retryable items.
//!
//! The retry services only see these traits. In-memory implementations back
//! tests and local runs; the Postgres implementations back production.

pub mod payouts;
pub mod postgres;
pub mod webhooks;

use learnhub_core::{PayoutId, WebhookEventId};

pub use payouts::{InMemoryPayoutStore, PayoutStore};
pub use postgres::{PostgresPayoutStore, PostgresWebhookEventStore};
pub use webhooks::{InMemoryWebhookEventStore, WebhookEventStore};

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("webhook event not found: {0}")]
    WebhookNotFound(WebhookEventId),
    #[error("payout not found: {0}")]
    PayoutNotFound(PayoutId),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}
