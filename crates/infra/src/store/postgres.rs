//! Postgres-backed webhook and payout stores.
//!
//! Attempts, retry config and payout metadata are stored as JSONB next to the
//! scalar columns the retry queries filter on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! The store traits are synchronous, like the retry loop that drives them.
//! Each store captures a `tokio::runtime::Handle` at construction and blocks on
//! it, so callers must run on a thread that is not itself a runtime worker
//! (the cron threads in `schedule` satisfy this).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use learnhub_core::{PayoutId, UserId, WebhookEventId};
use learnhub_payments::{
    AttemptRecord, FailureCategory, Payout, PayoutStatus, RetryConfig, WebhookEvent,
    WebhookSource, WebhookStatus,
};

use super::StoreError;
use super::payouts::PayoutStore;
use super::webhooks::WebhookEventStore;

const WEBHOOK_COLUMNS: &str = "id, provider_event_id, source, event_type, raw_payload, status, \
     retry_count, max_retries, next_retry_at, retry_config, attempts, failure_reason, \
     processing_time_ms, created_at, processed_at";

const PAYOUT_COLUMNS: &str = "id, teacher_id, amount_cents, currency, status, provider_payout_id, \
     retry_count, max_retries, next_retry_at, retry_config, failure_category, failure_reason, \
     attempts, metadata, created_at, updated_at, paid_at";

/// Postgres-backed webhook event store.
#[derive(Debug, Clone)]
pub struct PostgresWebhookEventStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresWebhookEventStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the `webhook_events` table and its retry index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                id                  UUID PRIMARY KEY,
                provider_event_id   TEXT NOT NULL UNIQUE,
                source              TEXT NOT NULL,
                event_type          TEXT NOT NULL,
                raw_payload         TEXT NOT NULL,
                status              TEXT NOT NULL,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                max_retries         INTEGER NOT NULL CHECK (max_retries > 0),
                next_retry_at       TIMESTAMPTZ NULL,
                retry_config        JSONB NOT NULL DEFAULT '{}'::jsonb,
                attempts            JSONB NOT NULL DEFAULT '[]'::jsonb,
                failure_reason      TEXT NULL,
                processing_time_ms  BIGINT NULL,
                created_at          TIMESTAMPTZ NOT NULL,
                processed_at        TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create webhook_events", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS webhook_events_retry_idx \
             ON webhook_events (status, next_retry_at)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create webhook_events_retry_idx", e))?;

        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, event), fields(provider_event_id = %event.provider_event_id), err)]
    pub async fn insert_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                id, provider_event_id, source, event_type, raw_payload, status,
                retry_count, max_retries, next_retry_at, retry_config, attempts,
                failure_reason, processing_time_ms, created_at, processed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.provider_event_id)
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(&event.raw_payload)
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.max_retries as i32)
        .bind(event.next_retry_at)
        .bind(Json(&event.retry_config))
        .bind(Json(&event.attempts))
        .bind(&event.failure_reason)
        .bind(event.processing_time_ms.map(|ms| ms as i64))
        .bind(event.created_at)
        .bind(event.processed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;
        Ok(())
    }

    pub async fn load(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>, StoreError> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_webhook_event", e))?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_due(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError> {
        let sql = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events \
             WHERE status = 'failed' \
               AND next_retry_at IS NOT NULL \
               AND next_retry_at <= $1 \
               AND retry_count < max_retries \
             ORDER BY next_retry_at ASC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_due_webhook_events", e))?;
        rows.iter().map(webhook_from_row).collect()
    }

    /// Lock the row, apply `f`, write back the retry bookkeeping.
    async fn transition<F>(
        &self,
        id: WebhookEventId,
        operation: &'static str,
        f: F,
    ) -> Result<WebhookEvent, StoreError>
    where
        F: FnOnce(&mut WebhookEvent) -> bool,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(StoreError::WebhookNotFound(id))?;
        let mut event = webhook_from_row(&row)?;

        if !f(&mut event) {
            // Terminal already; nothing to write.
            return Ok(event);
        }

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                attempts = $5,
                failure_reason = $6,
                processing_time_ms = $7,
                processed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(event.status.as_str())
        .bind(event.retry_count as i32)
        .bind(event.next_retry_at)
        .bind(Json(&event.attempts))
        .bind(&event.failure_reason)
        .bind(event.processing_time_ms.map(|ms| ms as i64))
        .bind(event.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(event)
    }
}

impl WebhookEventStore for PostgresWebhookEventStore {
    fn insert(&self, event: WebhookEvent) -> Result<WebhookEventId, StoreError> {
        self.block_on(self.insert_event(&event))
            .map_err(|e| match e {
                StoreError::AlreadyExists(_) => {
                    StoreError::AlreadyExists(event.provider_event_id.clone())
                }
                other => other,
            })?;
        Ok(event.id)
    }

    fn get(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>, StoreError> {
        self.block_on(self.load(id))
    }

    fn pending_retries(&self, now: DateTime<Utc>) -> Result<Vec<WebhookEvent>, StoreError> {
        self.block_on(self.load_due(now))
    }

    fn mark_processed(
        &self,
        id: WebhookEventId,
        processing_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.block_on(self.transition(id, "mark_processed", |e| {
            e.mark_processed(now, processing_time)
        }))
    }

    fn schedule_retry(
        &self,
        id: WebhookEventId,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.block_on(self.transition(id, "schedule_retry", |e| {
            e.schedule_retry(error, next_retry_at, now)
        }))
    }

    fn mark_failed(
        &self,
        id: WebhookEventId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, StoreError> {
        self.block_on(self.transition(id, "mark_failed", |e| e.mark_failed(reason, now)))
    }
}

/// Postgres-backed payout store.
#[derive(Debug, Clone)]
pub struct PostgresPayoutStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresPayoutStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the `payouts` table and its retry index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payouts (
                id                  UUID PRIMARY KEY,
                teacher_id          UUID NOT NULL,
                amount_cents        BIGINT NOT NULL,
                currency            TEXT NOT NULL,
                status              TEXT NOT NULL,
                provider_payout_id  TEXT NULL,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                max_retries         INTEGER NOT NULL CHECK (max_retries > 0),
                next_retry_at       TIMESTAMPTZ NULL,
                retry_config        JSONB NOT NULL DEFAULT '{}'::jsonb,
                failure_category    TEXT NULL,
                failure_reason      TEXT NULL,
                attempts            JSONB NOT NULL DEFAULT '[]'::jsonb,
                metadata            JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at          TIMESTAMPTZ NOT NULL,
                updated_at          TIMESTAMPTZ NOT NULL,
                paid_at             TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create payouts", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS payouts_retry_idx ON payouts (status, next_retry_at)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create payouts_retry_idx", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS payouts_provider_idx ON payouts (provider_payout_id)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create payouts_provider_idx", e))?;

        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, payout), fields(payout_id = %payout.id), err)]
    pub async fn insert_payout(&self, payout: &Payout) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payouts (
                id, teacher_id, amount_cents, currency, status, provider_payout_id,
                retry_count, max_retries, next_retry_at, retry_config, failure_category,
                failure_reason, attempts, metadata, created_at, updated_at, paid_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(payout.id.as_uuid())
        .bind(payout.teacher_id.as_uuid())
        .bind(payout.amount_cents)
        .bind(&payout.currency)
        .bind(payout.status.as_str())
        .bind(&payout.provider_payout_id)
        .bind(payout.retry_count as i32)
        .bind(payout.max_retries as i32)
        .bind(payout.next_retry_at)
        .bind(Json(&payout.retry_config))
        .bind(payout.failure_category.map(FailureCategory::as_str))
        .bind(&payout.failure_reason)
        .bind(Json(&payout.attempts))
        .bind(Json(&payout.metadata))
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .bind(payout.paid_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_payout", e))?;
        Ok(())
    }

    pub async fn load(&self, id: PayoutId) -> Result<Option<Payout>, StoreError> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_payout", e))?;
        row.as_ref().map(payout_from_row).transpose()
    }

    pub async fn load_by_provider_id(
        &self,
        provider_payout_id: &str,
    ) -> Result<Option<Payout>, StoreError> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE provider_payout_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(provider_payout_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_payout_by_provider_id", e))?;
        row.as_ref().map(payout_from_row).transpose()
    }

    #[instrument(
        skip(self, payout),
        fields(payout_id = %payout.id, status = payout.status.as_str()),
        err
    )]
    pub async fn update_payout(&self, payout: &Payout) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = $2,
                provider_payout_id = $3,
                retry_count = $4,
                next_retry_at = $5,
                retry_config = $6,
                failure_category = $7,
                failure_reason = $8,
                attempts = $9,
                metadata = $10,
                updated_at = $11,
                paid_at = $12
            WHERE id = $1
              AND status NOT IN ('paid', 'canceled')
              AND NOT (status = 'failed' AND next_retry_at IS NULL)
            "#,
        )
        .bind(payout.id.as_uuid())
        .bind(payout.status.as_str())
        .bind(&payout.provider_payout_id)
        .bind(payout.retry_count as i32)
        .bind(payout.next_retry_at)
        .bind(Json(&payout.retry_config))
        .bind(payout.failure_category.map(FailureCategory::as_str))
        .bind(&payout.failure_reason)
        .bind(Json(&payout.attempts))
        .bind(Json(&payout.metadata))
        .bind(payout.updated_at)
        .bind(payout.paid_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_payout", e))?;

        if result.rows_affected() == 0 {
            // Either missing or already terminal; only the former is an error.
            let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM payouts WHERE id = $1")
                .bind(payout.id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_payout", e))?;
            if exists.is_none() {
                return Err(StoreError::PayoutNotFound(payout.id));
            }
            debug!(payout_id = %payout.id, "skipped write to terminal payout");
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn load_failed_due(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts \
             WHERE status = 'failed' \
               AND next_retry_at IS NOT NULL \
               AND next_retry_at <= $1 \
               AND retry_count < max_retries \
             ORDER BY next_retry_at ASC, created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_failed_due", e))?;
        rows.iter().map(payout_from_row).collect()
    }
}

impl PayoutStore for PostgresPayoutStore {
    fn insert(&self, payout: Payout) -> Result<PayoutId, StoreError> {
        self.block_on(self.insert_payout(&payout))?;
        Ok(payout.id)
    }

    fn get(&self, id: PayoutId) -> Result<Option<Payout>, StoreError> {
        self.block_on(self.load(id))
    }

    fn find_by_provider_id(&self, provider_payout_id: &str) -> Result<Option<Payout>, StoreError> {
        self.block_on(self.load_by_provider_id(provider_payout_id))
    }

    fn update(&self, payout: &Payout) -> Result<(), StoreError> {
        self.block_on(self.update_payout(payout))
    }

    fn failed_due(&self, now: DateTime<Utc>) -> Result<Vec<Payout>, StoreError> {
        self.block_on(self.load_failed_due(now))
    }
}

fn column_error(column: &str, err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to read column {column}: {err}"))
}

fn get_u32(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column).map_err(|e| column_error(column, e))?;
    u32::try_from(value)
        .map_err(|_| StoreError::Storage(format!("negative value in column {column}: {value}")))
}

fn webhook_from_row(row: &PgRow) -> Result<WebhookEvent, StoreError> {
    let source: String = row.try_get("source").map_err(|e| column_error("source", e))?;
    let status: String = row.try_get("status").map_err(|e| column_error("status", e))?;
    let retry_config: Json<RetryConfig> = row
        .try_get("retry_config")
        .map_err(|e| column_error("retry_config", e))?;
    let attempts: Json<Vec<AttemptRecord>> =
        row.try_get("attempts").map_err(|e| column_error("attempts", e))?;
    let processing_time_ms: Option<i64> = row
        .try_get("processing_time_ms")
        .map_err(|e| column_error("processing_time_ms", e))?;

    Ok(WebhookEvent {
        id: WebhookEventId::from_uuid(row.try_get("id").map_err(|e| column_error("id", e))?),
        provider_event_id: row
            .try_get("provider_event_id")
            .map_err(|e| column_error("provider_event_id", e))?,
        source: WebhookSource::parse(&source)
            .ok_or_else(|| StoreError::Storage(format!("unknown webhook source: {source}")))?,
        event_type: row
            .try_get("event_type")
            .map_err(|e| column_error("event_type", e))?,
        raw_payload: row
            .try_get("raw_payload")
            .map_err(|e| column_error("raw_payload", e))?,
        status: WebhookStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown webhook status: {status}")))?,
        retry_count: get_u32(row, "retry_count")?,
        max_retries: get_u32(row, "max_retries")?,
        next_retry_at: row
            .try_get("next_retry_at")
            .map_err(|e| column_error("next_retry_at", e))?,
        retry_config: retry_config.0,
        attempts: attempts.0,
        failure_reason: row
            .try_get("failure_reason")
            .map_err(|e| column_error("failure_reason", e))?,
        processing_time_ms: processing_time_ms.map(|ms| ms.max(0) as u64),
        created_at: row
            .try_get("created_at")
            .map_err(|e| column_error("created_at", e))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| column_error("processed_at", e))?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<Payout, StoreError> {
    let status: String = row.try_get("status").map_err(|e| column_error("status", e))?;
    let failure_category: Option<String> = row
        .try_get("failure_category")
        .map_err(|e| column_error("failure_category", e))?;
    let retry_config: Json<RetryConfig> = row
        .try_get("retry_config")
        .map_err(|e| column_error("retry_config", e))?;
    let attempts: Json<Vec<AttemptRecord>> =
        row.try_get("attempts").map_err(|e| column_error("attempts", e))?;
    let metadata: Json<Map<String, JsonValue>> =
        row.try_get("metadata").map_err(|e| column_error("metadata", e))?;

    Ok(Payout {
        id: PayoutId::from_uuid(row.try_get("id").map_err(|e| column_error("id", e))?),
        teacher_id: UserId::from_uuid(
            row.try_get("teacher_id")
                .map_err(|e| column_error("teacher_id", e))?,
        ),
        amount_cents: row
            .try_get("amount_cents")
            .map_err(|e| column_error("amount_cents", e))?,
        currency: row.try_get("currency").map_err(|e| column_error("currency", e))?,
        status: PayoutStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown payout status: {status}")))?,
        provider_payout_id: row
            .try_get("provider_payout_id")
            .map_err(|e| column_error("provider_payout_id", e))?,
        retry_count: get_u32(row, "retry_count")?,
        max_retries: get_u32(row, "max_retries")?,
        next_retry_at: row
            .try_get("next_retry_at")
            .map_err(|e| column_error("next_retry_at", e))?,
        retry_config: retry_config.0,
        // Categories written by newer code than this reader degrade to Unknown.
        failure_category: failure_category
            .map(|c| FailureCategory::parse(&c).unwrap_or(FailureCategory::Unknown)),
        failure_reason: row
            .try_get("failure_reason")
            .map_err(|e| column_error("failure_reason", e))?,
        attempts: attempts.0,
        metadata: metadata.0,
        created_at: row
            .try_get("created_at")
            .map_err(|e| column_error("created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| column_error("updated_at", e))?,
        paid_at: row.try_get("paid_at").map_err(|e| column_error("paid_at", e))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
