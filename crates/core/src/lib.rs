//! `learnhub-core`: shared building blocks for the payments services.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{PayoutId, UserId, WebhookEventId};
