//! Routes typed provider events to their side effects.
//!
//! Handlers read current state before writing, so re-dispatching a payload that
//! was already (partially) applied does not repeat its effect.

mod handlers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use learnhub_core::{DomainError, UserId};
use learnhub_payments::{PaymentEvent, WebhookSource};

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::ledger::{LedgerError, PaymentLedger};
use crate::store::{PayoutStore, StoreError};

/// Which kind of user a handled event concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AffectedUserType {
    Student,
    Teacher,
}

/// Outcome of one dispatch.
///
/// The retry loop only looks at `success` and `error`; the other fields are
/// forwarded to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResult {
    pub success: bool,
    pub error: Option<String>,
    pub processing_time: Duration,
    pub affected_user_id: Option<UserId>,
    pub affected_user_type: Option<AffectedUserType>,
    pub related_resource_ids: Vec<String>,
}

impl HandlerResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn affecting(mut self, user_id: Option<UserId>, user_type: AffectedUserType) -> Self {
        self.affected_user_id = user_id;
        self.affected_user_type = Some(user_type);
        self
    }

    pub fn related(mut self, id: impl Into<String>) -> Self {
        self.related_resource_ids.push(id.into());
        self
    }
}

/// Errors that abort a dispatch (as opposed to a handler reporting failure).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid payload: {0}")]
    Payload(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Handler dispatch over the closed [`PaymentEvent`] set.
#[derive(Clone)]
pub struct HandlerDispatch {
    payouts: Arc<dyn PayoutStore>,
    ledger: Arc<dyn PaymentLedger>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl HandlerDispatch {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        ledger: Arc<dyn PaymentLedger>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            payouts,
            ledger,
            audit,
            clock,
        }
    }

    /// Parse a raw body for `source` and dispatch it.
    pub fn dispatch_raw(
        &self,
        source: WebhookSource,
        raw_payload: &str,
    ) -> Result<HandlerResult, DispatchError> {
        let event = PaymentEvent::parse(source, raw_payload)?;
        self.dispatch(source, &event)
    }

    pub fn dispatch(
        &self,
        source: WebhookSource,
        event: &PaymentEvent,
    ) -> Result<HandlerResult, DispatchError> {
        if let PaymentEvent::Unrecognized { event_type } = event {
            debug!(source = source.as_str(), event_type, "ignoring unrecognized event type");
            return Ok(HandlerResult {
                processing_time: Duration::ZERO,
                ..HandlerResult::ok()
            });
        }

        let started = Instant::now();
        let mut result = match event {
            PaymentEvent::CheckoutSessionCompleted(session) => {
                handlers::checkout_completed(self.ledger.as_ref(), session)?
            }
            PaymentEvent::PaymentIntentSucceeded(intent) => {
                handlers::payment_succeeded(self.ledger.as_ref(), intent)?
            }
            PaymentEvent::PaymentIntentFailed(intent) => {
                handlers::payment_failed(self.ledger.as_ref(), intent)?
            }
            PaymentEvent::ChargeRefunded(charge) => {
                handlers::charge_refunded(self.ledger.as_ref(), charge)?
            }
            PaymentEvent::ChargeDisputeCreated(dispute) => {
                handlers::dispute_created(self.ledger.as_ref(), dispute)?
            }
            PaymentEvent::AccountUpdated(account) => {
                handlers::account_updated(self.ledger.as_ref(), account)?
            }
            PaymentEvent::PayoutPaid(payout) => handlers::payout_paid(
                self.payouts.as_ref(),
                self.ledger.as_ref(),
                payout,
                self.clock.now(),
            )?,
            PaymentEvent::PayoutFailed(payout) => handlers::payout_failed(
                self.payouts.as_ref(),
                self.audit.as_ref(),
                payout,
                self.clock.now(),
            )?,
            PaymentEvent::PayoutCanceled(payout) => {
                handlers::payout_canceled(self.payouts.as_ref(), payout, self.clock.now())?
            }
            PaymentEvent::Unrecognized { .. } => HandlerResult::ok(),
        };
        result.processing_time = started.elapsed();

        debug!(
            source = source.as_str(),
            event_type = event.event_type(),
            success = result.success,
            "event dispatched"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for HandlerDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDispatch")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
