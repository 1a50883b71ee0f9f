//! `learnhub-payments`: payment-side domain model.
//!
//! Webhook events and teacher payouts with their retry bookkeeping, the backoff
//! policy, the failure classifier, and the typed provider event union. No IO.

pub mod attempt;
pub mod backoff;
pub mod event;
pub mod failure;
pub mod payout;
pub mod webhook;

pub use attempt::{AttemptRecord, AttemptStatus};
pub use backoff::RetryConfig;
pub use event::{
    Charge, CheckoutSession, ConnectedAccount, Dispute, ObjectMetadata, PaymentEvent,
    PaymentIntent, ProviderPayout, WebhookEnvelope,
};
pub use failure::FailureCategory;
pub use payout::{Payout, PayoutStatus};
pub use webhook::{WebhookEvent, WebhookSource, WebhookStatus};
