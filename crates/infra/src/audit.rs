//! Audit trail for retry activity.
//!
//! Records are handed to an [`AuditSink`]; the compliance subsystem that stores
//! and queries them lives elsewhere.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Webhook,
    Payout,
    RetryCycle,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Webhook => "webhook",
            AuditCategory::Payout => "payout",
            AuditCategory::RetryCycle => "retry_cycle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

/// One structured audit entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub category: AuditCategory,
    pub level: AuditLevel,
    pub message: String,
    pub metadata: Map<String, JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        category: AuditCategory,
        level: AuditLevel,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            category,
            level,
            message: message.into(),
            metadata: Map::new(),
            occurred_at,
        }
    }

    /// Attach a metadata field. Values that fail to serialize are stored as null.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.metadata.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Emits audit records as structured `tracing` events under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let metadata = JsonValue::Object(record.metadata).to_string();
        let category = record.category.as_str();
        match record.level {
            AuditLevel::Info => {
                info!(target: "audit", category, metadata = %metadata, "{}", record.message)
            }
            AuditLevel::Warning => {
                warn!(target: "audit", category, metadata = %metadata, "{}", record.message)
            }
            AuditLevel::Critical => {
                error!(target: "audit", category, metadata = %metadata, "{}", record.message)
            }
        }
        Ok(())
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    unavailable: Mutex<bool>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn by_level(&self, level: AuditLevel) -> Vec<AuditRecord> {
        self.all().into_iter().filter(|r| r.level == level).collect()
    }

    /// Simulate an outage: every `record` call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        if *self.unavailable.lock().unwrap() {
            return Err(AuditError::Unavailable("in-memory sink disabled".to_string()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
