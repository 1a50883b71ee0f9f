//! Typed view of provider webhook payloads.
//!
//! A raw payload is parsed into a [`WebhookEnvelope`] and then narrowed into a
//! [`PaymentEvent`] according to the endpoint it arrived on. Handlers match on
//! the enum, so adding a variant forces every dispatch site to handle it.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use learnhub_core::{DomainError, DomainResult};

use crate::webhook::WebhookSource;

/// Outer shape shared by every provider event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Connected account id for connect-endpoint events.
    #[serde(default)]
    pub account: Option<String>,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub object: JsonValue,
}

impl WebhookEnvelope {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw).map_err(|e| DomainError::malformed_payload(e.to_string()))
    }
}

/// String metadata attached to provider objects (`userId`, `courseId`, ...).
pub type ObjectMetadata = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_refunded: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: String,
    pub charge: String,
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayout {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    /// Carries `payoutId`, our payout record id.
    #[serde(default)]
    pub metadata: ObjectMetadata,
}

/// Closed set of events the platform reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    CheckoutSessionCompleted(CheckoutSession),
    PaymentIntentSucceeded(PaymentIntent),
    PaymentIntentFailed(PaymentIntent),
    ChargeRefunded(Charge),
    ChargeDisputeCreated(Dispute),
    AccountUpdated(ConnectedAccount),
    PayoutPaid(ProviderPayout),
    PayoutFailed(ProviderPayout),
    PayoutCanceled(ProviderPayout),
    /// Anything else, including a known type delivered to the other endpoint.
    Unrecognized { event_type: String },
}

fn object<T: DeserializeOwned>(envelope: &WebhookEnvelope) -> DomainResult<T> {
    serde_json::from_value(envelope.data.object.clone()).map_err(|e| {
        DomainError::malformed_payload(format!("{} ({}): {}", envelope.event_type, envelope.id, e))
    })
}

impl PaymentEvent {
    /// Narrow an envelope into a typed event for the given endpoint.
    pub fn from_envelope(source: WebhookSource, envelope: &WebhookEnvelope) -> DomainResult<Self> {
        let event = match (source, envelope.event_type.as_str()) {
            (WebhookSource::Payments, "checkout.session.completed") => {
                PaymentEvent::CheckoutSessionCompleted(object(envelope)?)
            }
            (WebhookSource::Payments, "payment_intent.succeeded") => {
                PaymentEvent::PaymentIntentSucceeded(object(envelope)?)
            }
            (WebhookSource::Payments, "payment_intent.payment_failed") => {
                PaymentEvent::PaymentIntentFailed(object(envelope)?)
            }
            (WebhookSource::Payments, "charge.refunded") => {
                PaymentEvent::ChargeRefunded(object(envelope)?)
            }
            (WebhookSource::Payments, "charge.dispute.created") => {
                PaymentEvent::ChargeDisputeCreated(object(envelope)?)
            }
            (WebhookSource::Connect, "account.updated") => {
                PaymentEvent::AccountUpdated(object(envelope)?)
            }
            (WebhookSource::Connect, "payout.paid") => PaymentEvent::PayoutPaid(object(envelope)?),
            (WebhookSource::Connect, "payout.failed") => {
                PaymentEvent::PayoutFailed(object(envelope)?)
            }
            (WebhookSource::Connect, "payout.canceled") => {
                PaymentEvent::PayoutCanceled(object(envelope)?)
            }
            (_, other) => PaymentEvent::Unrecognized {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }

    /// Parse a raw body straight into a typed event.
    pub fn parse(source: WebhookSource, raw: &str) -> DomainResult<Self> {
        let envelope = WebhookEnvelope::parse(raw)?;
        Self::from_envelope(source, &envelope)
    }

    pub fn event_type(&self) -> &str {
        match self {
            PaymentEvent::CheckoutSessionCompleted(_) => "checkout.session.completed",
            PaymentEvent::PaymentIntentSucceeded(_) => "payment_intent.succeeded",
            PaymentEvent::PaymentIntentFailed(_) => "payment_intent.payment_failed",
            PaymentEvent::ChargeRefunded(_) => "charge.refunded",
            PaymentEvent::ChargeDisputeCreated(_) => "charge.dispute.created",
            PaymentEvent::AccountUpdated(_) => "account.updated",
            PaymentEvent::PayoutPaid(_) => "payout.paid",
            PaymentEvent::PayoutFailed(_) => "payout.failed",
            PaymentEvent::PayoutCanceled(_) => "payout.canceled",
            PaymentEvent::Unrecognized { event_type } => event_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, object: JsonValue) -> String {
        json!({
            "id": "evt_test",
            "type": event_type,
            "data": { "object": object }
        })
        .to_string()
    }

    #[test]
    fn parses_connect_payout_event() {
        let body = raw(
            "payout.failed",
            json!({
                "id": "po_1",
                "amount": 4200,
                "currency": "usd",
                "failure_code": "account_closed",
                "metadata": { "payoutId": "0190a1b2-0000-7000-8000-000000000000" }
            }),
        );

        match PaymentEvent::parse(WebhookSource::Connect, &body).unwrap() {
            PaymentEvent::PayoutFailed(p) => {
                assert_eq!(p.id, "po_1");
                assert_eq!(p.failure_code.as_deref(), Some("account_closed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn known_type_on_wrong_endpoint_is_unrecognized() {
        let body = raw("payout.paid", json!({"id": "po_1", "amount": 1, "currency": "usd"}));

        let event = PaymentEvent::parse(WebhookSource::Payments, &body).unwrap();
        assert_eq!(
            event,
            PaymentEvent::Unrecognized {
                event_type: "payout.paid".to_string()
            }
        );
    }

    #[test]
    fn unknown_type_does_not_require_a_typed_object() {
        let body = raw("customer.tax_id.created", json!({"weird": true}));
        let event = PaymentEvent::parse(WebhookSource::Payments, &body).unwrap();
        assert_eq!(event.event_type(), "customer.tax_id.created");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            PaymentEvent::parse(WebhookSource::Payments, "{not json"),
            Err(DomainError::MalformedPayload(_))
        ));

        let body = raw("payment_intent.succeeded", json!({"id": "pi_1"}));
        assert!(matches!(
            PaymentEvent::parse(WebhookSource::Payments, &body),
            Err(DomainError::MalformedPayload(_))
        ));
    }
}
