//! Cron-driven triggers for retry jobs.
//!
//! A [`ScheduledTask`] owns a thread that fires its [`RetryJob`] whenever the
//! cron schedule comes due or [`ScheduledTaskHandle::trigger`] is called.
//! Shutdown is observed between cycles; a running cycle is never interrupted.

use std::str::FromStr;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::retry::RetryJob;

/// Webhook retry cadence: every 5 minutes.
pub const WEBHOOK_RETRY_CRON: &str = "*/5 * * * *";

/// Payout retry cadence: every 15 minutes.
pub const PAYOUT_RETRY_CRON: &str = "*/15 * * * *";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("cron expression '{0}' has no upcoming run")]
    NoUpcomingRun(String),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Parsed cron schedule.
///
/// Accepts the classic five-field form (minute first) as well as the
/// six-field form with a leading seconds column.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    expression: String,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let normalized = match expression.split_whitespace().count() {
            5 => format!("0 {expression}"),
            _ => expression.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Handle for a running scheduled task (shutdown + manual trigger).
#[derive(Debug)]
pub struct ScheduledTaskHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ScheduledTaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the job as soon as the current cycle (if any) finishes.
    ///
    /// Triggers are coalesced; extra calls while one is pending are dropped.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop the task and wait for its thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(task = self.name, "scheduled task thread panicked");
            }
        }
    }
}

pub struct ScheduledTask;

impl ScheduledTask {
    pub fn spawn(
        name: &'static str,
        schedule: CronSchedule,
        job: Arc<dyn RetryJob>,
        run_on_start: bool,
    ) -> Result<ScheduledTaskHandle, ScheduleError> {
        let first_run = schedule
            .next_after(Utc::now())
            .ok_or_else(|| ScheduleError::NoUpcomingRun(schedule.expression().to_string()))?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            task_loop(
                name,
                schedule,
                job,
                first_run,
                run_on_start,
                shutdown_rx,
                trigger_rx,
            )
        })?;

        Ok(ScheduledTaskHandle {
            name,
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join: Some(join),
        })
    }
}

fn task_loop(
    name: &'static str,
    schedule: CronSchedule,
    job: Arc<dyn RetryJob>,
    first_run: DateTime<Utc>,
    run_on_start: bool,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
) {
    info!(
        task = name,
        job = job.name(),
        cron = schedule.expression(),
        next_run = %first_run,
        "scheduled task started"
    );

    let mut next_run = first_run;
    let mut pending = run_on_start;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let now = Utc::now();
        if now >= next_run {
            pending = true;
            match schedule.next_after(now) {
                Some(next) => next_run = next,
                None => {
                    warn!(task = name, "cron schedule exhausted; stopping");
                    break;
                }
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        pending = false;

        match job.run_once() {
            Ok(summary) => info!(
                task = name,
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                rescheduled = summary.rescheduled,
                "retry cycle complete"
            ),
            // Nothing is lost: the next cycle picks up the same due items.
            Err(e) => error!(task = name, error = %e, "retry cycle failed"),
        }
    }

    info!(task = name, "scheduled task stopped");
}
