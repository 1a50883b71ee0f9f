use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
}

/// Audit trail entry for one retry attempt. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl AttemptRecord {
    pub fn succeeded(attempt_number: u32, attempted_at: DateTime<Utc>) -> Self {
        Self {
            attempt_number,
            attempted_at,
            status: AttemptStatus::Succeeded,
            failure_reason: None,
        }
    }

    pub fn failed(
        attempt_number: u32,
        attempted_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            attempt_number,
            attempted_at,
            status: AttemptStatus::Failed,
            failure_reason: Some(reason.into()),
        }
    }
}
