//! Stored webhook events and their retry bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use learnhub_core::{DomainResult, WebhookEventId};

use crate::attempt::AttemptRecord;
use crate::backoff::RetryConfig;

/// Which provider endpoint delivered the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookSource {
    /// Platform account events (checkout, payment intents, charges).
    Payments,
    /// Connected-account events (teacher accounts and their payouts).
    Connect,
}

impl WebhookSource {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookSource::Payments => "payments",
            WebhookSource::Connect => "connect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payments" => Some(WebhookSource::Payments),
            "connect" => Some(WebhookSource::Connect),
            _ => None,
        }
    }
}

impl core::fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    /// Received, not yet processed.
    Pending,
    /// Processing failed; retried while `next_retry_at` is set.
    Failed,
    Processed,
}

impl WebhookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Failed => "failed",
            WebhookStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WebhookStatus::Pending),
            "failed" => Some(WebhookStatus::Failed),
            "processed" => Some(WebhookStatus::Processed),
            _ => None,
        }
    }
}

/// A webhook event as persisted by the receiver.
///
/// `raw_payload` is kept verbatim and re-parsed on every retry, so handlers
/// always run against the original body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    /// Provider-assigned id (`evt_...`).
    pub provider_event_id: String,
    pub source: WebhookSource,
    pub event_type: String,
    pub raw_payload: String,
    pub status: WebhookStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub failure_reason: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    pub fn new(
        provider_event_id: impl Into<String>,
        source: WebhookSource,
        event_type: impl Into<String>,
        raw_payload: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            provider_event_id: provider_event_id.into(),
            source,
            event_type: event_type.into(),
            raw_payload: raw_payload.into(),
            status: WebhookStatus::Pending,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            retry_config: RetryConfig::default(),
            attempts: Vec::new(),
            failure_reason: None,
            processing_time_ms: None,
            created_at: now,
            processed_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Replace the backoff configuration. Rejects configs that fail validation.
    pub fn with_retry_config(mut self, config: RetryConfig) -> DomainResult<Self> {
        config.validate()?;
        self.retry_config = config;
        Ok(self)
    }

    /// Processed, or failed with no retry pending.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            WebhookStatus::Processed => true,
            WebhookStatus::Failed => self.next_retry_at.is_none(),
            WebhookStatus::Pending => false,
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Selection predicate for the retry cycle.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == WebhookStatus::Failed
            && self.has_retry_budget()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    fn next_attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    /// First processing by the receiver failed; hand the event to the retry cycle.
    ///
    /// Not a retry attempt: `retry_count` and `attempts` are left alone.
    pub fn record_initial_failure(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
    ) -> bool {
        if self.status != WebhookStatus::Pending {
            return false;
        }
        self.status = WebhookStatus::Failed;
        self.failure_reason = Some(error.into());
        self.next_retry_at = Some(next_retry_at);
        true
    }

    /// Successful retry attempt. Returns `false` (and changes nothing) if terminal.
    pub fn mark_processed(&mut self, now: DateTime<Utc>, processing_time: Duration) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.attempts
            .push(AttemptRecord::succeeded(self.next_attempt_number(), now));
        self.retry_count += 1;
        self.status = WebhookStatus::Processed;
        self.next_retry_at = None;
        self.processing_time_ms = Some(processing_time.as_millis() as u64);
        self.processed_at = Some(now);
        true
    }

    /// Failed retry attempt with budget remaining.
    pub fn schedule_retry(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        let error = error.into();
        self.attempts.push(AttemptRecord::failed(
            self.next_attempt_number(),
            now,
            error.clone(),
        ));
        self.retry_count += 1;
        self.status = WebhookStatus::Failed;
        self.failure_reason = Some(error);
        self.next_retry_at = Some(next_retry_at);
        true
    }

    /// Failed retry attempt that ends retrying.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.attempts.push(AttemptRecord::failed(
            self.next_attempt_number(),
            now,
            reason.clone(),
        ));
        self.retry_count += 1;
        self.status = WebhookStatus::Failed;
        self.failure_reason = Some(reason);
        self.next_retry_at = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptStatus;

    fn failed_event(now: DateTime<Utc>) -> WebhookEvent {
        let mut event = WebhookEvent::new(
            "evt_1",
            WebhookSource::Connect,
            "payout.paid",
            "{}",
            now,
        )
        .with_max_retries(3);
        event.record_initial_failure("handler crashed", now);
        event
    }

    #[test]
    fn initial_failure_makes_event_due() {
        let now = Utc::now();
        let event = failed_event(now);

        assert!(event.is_due(now));
        assert!(!event.is_due(now - chrono::Duration::seconds(1)));
        assert_eq!(event.retry_count, 0);
        assert!(event.attempts.is_empty());
    }

    #[test]
    fn processed_is_terminal_and_idempotent() {
        let now = Utc::now();
        let mut event = failed_event(now);

        assert!(event.mark_processed(now, Duration::from_millis(12)));
        assert!(event.is_terminal());
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.attempts[0].status, AttemptStatus::Succeeded);

        assert!(!event.mark_processed(now, Duration::from_millis(5)));
        assert!(!event.schedule_retry("late", now, now));
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.attempts.len(), 1);
    }

    #[test]
    fn attempts_track_retry_count() {
        let now = Utc::now();
        let mut event = failed_event(now);

        event.schedule_retry("boom", now + chrono::Duration::minutes(1), now);
        event.schedule_retry("boom", now + chrono::Duration::minutes(2), now);
        event.mark_failed("Max retries exceeded: boom", now);

        assert_eq!(event.retry_count, 3);
        assert_eq!(event.attempts.len(), 3);
        assert_eq!(
            event.attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(event.is_terminal());
        assert!(!event.is_due(now + chrono::Duration::days(1)));
    }
}
