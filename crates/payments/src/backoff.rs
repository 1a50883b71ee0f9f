//! Per-item backoff configuration and next-retry computation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use learnhub_core::{DomainError, DomainResult};

pub const DEFAULT_BASE_DELAY_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_MS: u64 = 3_600_000;

/// Upper bound of the jitter component, as a fraction of the computed delay.
pub const JITTER_FACTOR: f64 = 0.1;

/// Retry configuration stored alongside each retryable item.
///
/// Omitted fields fall back to the defaults above, so records written before a
/// field existed still produce a usable policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: None,
            backoff_multiplier: None,
            max_delay_ms: None,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fully specified exponential policy.
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: Some(base_delay.as_millis() as u64),
            backoff_multiplier: Some(multiplier),
            max_delay_ms: Some(max_delay.as_millis() as u64),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS)
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER)
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS)
    }

    /// Reject configurations that would make backoff shrink or never start.
    pub fn validate(&self) -> DomainResult<()> {
        let multiplier = self.backoff_multiplier();
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(DomainError::validation(format!(
                "backoff multiplier must be a finite value >= 1.0, got {multiplier}"
            )));
        }
        if self.base_delay_ms() == 0 {
            return Err(DomainError::validation("base delay must be greater than zero"));
        }
        if self.max_delay_ms() < self.base_delay_ms() {
            return Err(DomainError::validation(format!(
                "max delay ({}ms) is below base delay ({}ms)",
                self.max_delay_ms(),
                self.base_delay_ms()
            )));
        }
        Ok(())
    }

    /// Deterministic part of the backoff: `min(base * multiplier^retry_count, max)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay_ms() as f64;
        let max_ms = self.max_delay_ms() as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);

        let delay_ms = base_ms * self.backoff_multiplier().powi(exponent);
        // f64::min ignores NaN, so an overflowing product still saturates at max.
        let capped = delay_ms.min(max_ms);

        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Random component in `[0, JITTER_FACTOR * delay]`, or zero when disabled.
    pub fn jitter_for<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        let factor: f64 = rng.random();
        let jitter_ms = factor * JITTER_FACTOR * delay.as_millis() as f64;
        Duration::from_millis(jitter_ms as u64)
    }

    /// `now + delay_for(retry_count) + jitter`.
    pub fn next_retry_at<R: Rng + ?Sized>(
        &self,
        retry_count: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        let total = delay + self.jitter_for(delay, rng);
        let millis = i64::try_from(total.as_millis()).unwrap_or(i64::MAX);

        chrono::Duration::try_milliseconds(millis)
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
