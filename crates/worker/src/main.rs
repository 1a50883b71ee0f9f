use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use learnhub_infra::audit::{AuditSink, TracingAuditSink};
use learnhub_infra::clock::{Clock, SystemClock};
use learnhub_infra::config::WorkerConfig;
use learnhub_infra::dispatch::HandlerDispatch;
use learnhub_infra::ledger::{InMemoryPaymentLedger, PaymentLedger};
use learnhub_infra::processor::{PayoutProcessor, SimulatedPayoutProcessor};
use learnhub_infra::retry::{PayoutRetryService, WebhookRetryService};
use learnhub_infra::schedule::{
    CronSchedule, PAYOUT_RETRY_CRON, ScheduledTask, ScheduledTaskHandle, WEBHOOK_RETRY_CRON,
};
use learnhub_infra::store::{
    InMemoryPayoutStore, InMemoryWebhookEventStore, PayoutStore, PostgresPayoutStore,
    PostgresWebhookEventStore, WebhookEventStore,
};

struct Stores {
    webhooks: Arc<dyn WebhookEventStore>,
    payouts: Arc<dyn PayoutStore>,
}

async fn build_stores(config: &WorkerConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory stores (nothing survives a restart)");
        return Ok(Stores {
            webhooks: Arc::new(InMemoryWebhookEventStore::new()),
            payouts: Arc::new(InMemoryPayoutStore::new()),
        });
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    // Store calls block on this handle from the scheduler threads.
    let runtime = tokio::runtime::Handle::current();

    let webhooks = PostgresWebhookEventStore::new(pool.clone(), runtime.clone());
    webhooks
        .ensure_schema()
        .await
        .context("failed to prepare webhook_events schema")?;

    let payouts = PostgresPayoutStore::new(pool, runtime);
    payouts
        .ensure_schema()
        .await
        .context("failed to prepare payouts schema")?;

    info!(
        max_connections = config.database_max_connections,
        "using Postgres stores"
    );
    Ok(Stores {
        webhooks: Arc::new(webhooks),
        payouts: Arc::new(payouts),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    learnhub_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let stores = build_stores(&config).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    // The provider transfer API and the course ledger database live outside
    // this worker. Config loading already refused Postgres without the opt-in.
    if config.database_url.is_some() {
        warn!("ALLOW_SIMULATED_PROVIDER set; simulated collaborators write to Postgres");
    } else {
        warn!("payment ledger and payout processor are simulated in this build");
    }
    let ledger: Arc<dyn PaymentLedger> = Arc::new(InMemoryPaymentLedger::new());
    let processor: Arc<dyn PayoutProcessor> = Arc::new(SimulatedPayoutProcessor::new());

    let dispatch = Arc::new(HandlerDispatch::new(
        stores.payouts.clone(),
        ledger,
        audit.clone(),
        clock.clone(),
    ));

    let mut tasks: Vec<ScheduledTaskHandle> = Vec::new();

    if config.webhooks_enabled {
        let job = Arc::new(WebhookRetryService::new(
            stores.webhooks.clone(),
            dispatch,
            audit.clone(),
            clock.clone(),
        ));
        tasks.push(ScheduledTask::spawn(
            "webhook-retry",
            CronSchedule::parse(WEBHOOK_RETRY_CRON)?,
            job,
            config.run_on_startup,
        )?);
    }

    if config.payouts_enabled {
        let job = Arc::new(PayoutRetryService::new(
            stores.payouts.clone(),
            processor,
            audit,
            clock,
        ));
        tasks.push(ScheduledTask::spawn(
            "payout-retry",
            CronSchedule::parse(PAYOUT_RETRY_CRON)?,
            job,
            config.run_on_startup,
        )?);
    }

    if tasks.is_empty() {
        warn!("all retry jobs are disabled; waiting for shutdown");
    }
    info!(
        tasks = ?tasks.iter().map(ScheduledTaskHandle::name).collect::<Vec<_>>(),
        "retry worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; waiting for running cycles to finish");

    // Joining blocks until in-flight cycles end, which may still need the runtime.
    tokio::task::spawn_blocking(move || {
        for task in tasks {
            task.shutdown();
        }
    })
    .await
    .context("scheduler shutdown panicked")?;

    info!("retry worker stopped");
    Ok(())
}
