//! Cooperative Scheduler
//!
//! Every minute a worker tries to take a lease-based advisory lock; the
//! holder scans due `scheduled_tasks` rows and evaluates their launchers.
//! A condition that fails is a skip, not a failure; launcher errors count
//! against the task's retry budget and disable it when exhausted.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rusqlite::{OptionalExtension, params};

use crate::error::{EngineError, Result};
use crate::jobs::launchers::{LaunchContext, LaunchDecision, Launcher};
use crate::jobs::{CancelFlag, JobQueue, ScheduledTask};
use crate::storage::GraphStore;

/// Scheduler tick period
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Advisory-lock lease; refreshed every tick, expires on crash
const LEASE_SECONDS: i64 = 120;

/// Try to take (or refresh) the advisory lock for `key`
///
/// Lease-based: a crashed holder frees the lock by expiry. At most one
/// holder per key exists at any time.
pub fn acquire_advisory_lock(store: &GraphStore, key: &str, holder: &str) -> Result<bool> {
    let now = Utc::now();
    let expires = (now + chrono::Duration::seconds(LEASE_SECONDS)).to_rfc3339();

    let writer = store.writer_guard()?;
    let tx = writer.unchecked_transaction()?;

    tx.execute(
        "DELETE FROM advisory_locks WHERE lock_key = ?1 AND expires_at < ?2",
        params![key, now.to_rfc3339()],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO advisory_locks (lock_key, holder, expires_at) VALUES (?1, ?2, ?3)",
        params![key, holder, expires],
    )?;
    let current: String = tx.query_row(
        "SELECT holder FROM advisory_locks WHERE lock_key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    let held = current == holder;
    if held {
        tx.execute(
            "UPDATE advisory_locks SET expires_at = ?1 WHERE lock_key = ?2",
            params![expires, key],
        )?;
    }
    tx.commit()?;
    Ok(held)
}

/// Release an advisory lock held by `holder`
pub fn release_advisory_lock(store: &GraphStore, key: &str, holder: &str) -> Result<()> {
    let writer = store.writer_guard()?;
    writer.execute(
        "DELETE FROM advisory_locks WHERE lock_key = ?1 AND holder = ?2",
        params![key, holder],
    )?;
    Ok(())
}

/// Result of one scheduler tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// This process held the leader lock for the tick
    pub leader: bool,
    pub launched: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Single-leader scheduler over the `scheduled_tasks` table
pub struct Scheduler {
    store: Arc<GraphStore>,
    queue: Arc<JobQueue>,
    context: LaunchContext,
    launchers: HashMap<&'static str, Arc<dyn Launcher>>,
    holder_id: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<GraphStore>,
        queue: Arc<JobQueue>,
        context: LaunchContext,
        launchers: Vec<Arc<dyn Launcher>>,
    ) -> Self {
        let launchers = launchers
            .into_iter()
            .map(|launcher| (launcher.name(), launcher))
            .collect();
        Self {
            store,
            queue,
            context,
            launchers,
            holder_id: format!("sched_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Register (or update) a scheduled task
    ///
    /// Cron expressions use the seconds-first form, e.g.
    /// `"0 */5 * * * *"` for every five minutes.
    pub fn register_task(&self, name: &str, cron_expression: &str, launcher: &str) -> Result<()> {
        if !self.launchers.contains_key(launcher) {
            return Err(EngineError::NotFound(format!("launcher {}", launcher)));
        }
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            EngineError::Internal(format!("invalid cron expression {:?}: {}", cron_expression, e))
        })?;
        let next_run = schedule.after(&Utc::now()).next().map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        let writer = self.store.writer_guard()?;
        writer.execute(
            "INSERT INTO scheduled_tasks (name, cron_expression, launcher, enabled, next_run,
                                          retry_count, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, 0, 3, ?5, ?5)
             ON CONFLICT (name) DO UPDATE SET
               cron_expression = excluded.cron_expression,
               launcher = excluded.launcher,
               next_run = excluded.next_run,
               updated_at = excluded.updated_at",
            params![name, cron_expression, launcher, next_run, now],
        )?;
        Ok(())
    }

    /// Run the scheduler loop until cancelled
    pub async fn run(&self, cancel: CancelFlag) {
        while !cancel.is_cancelled() {
            match self.tick().await {
                Ok(report) if report.leader => {
                    tracing::debug!(
                        launched = report.launched,
                        skipped = report.skipped,
                        errors = report.errors,
                        "scheduler tick complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("scheduler tick failed: {}", e),
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
        let key = self.context.registry.settings().scheduler_advisory_lock_key;
        if let Err(e) = release_advisory_lock(&self.store, &key, &self.holder_id) {
            tracing::warn!("failed to release scheduler lock: {}", e);
        }
    }

    /// One scheduler pass: acquire leadership, scan due tasks, launch
    pub async fn tick(&self) -> Result<TickReport> {
        let key = self.context.registry.settings().scheduler_advisory_lock_key;
        if !acquire_advisory_lock(&self.store, &key, &self.holder_id)? {
            return Ok(TickReport::default());
        }

        let mut report = TickReport {
            leader: true,
            ..Default::default()
        };

        for task in self.due_tasks()? {
            match self.fire(&task).await {
                Ok(true) => report.launched += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    self.record_task_error(&task, &e)?;
                }
            }
        }
        Ok(report)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
        let parse_ts = |value: Option<String>| {
            value.and_then(|v| {
                DateTime::parse_from_rfc3339(&v)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            })
        };
        Ok(ScheduledTask {
            name: row.get("name")?,
            cron_expression: row.get("cron_expression")?,
            launcher: row.get("launcher")?,
            enabled: row.get("enabled")?,
            last_run: parse_ts(row.get("last_run")?),
            last_success: parse_ts(row.get("last_success")?),
            next_run: parse_ts(row.get("next_run")?),
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
        })
    }

    /// Enabled tasks whose next_run is due
    fn due_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM scheduled_tasks
             WHERE enabled = 1 AND (next_run IS NULL OR next_run <= ?1)
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![Utc::now().to_rfc3339()], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Evaluate one due task; true when a job was enqueued
    async fn fire(&self, task: &ScheduledTask) -> Result<bool> {
        let launcher = self
            .launchers
            .get(task.launcher.as_str())
            .ok_or_else(|| EngineError::NotFound(format!("launcher {}", task.launcher)))?;

        let decision = launcher.evaluate(&self.context).await?;
        let launched = match decision {
            LaunchDecision::Launch(spec) => {
                let job = self.queue.enqueue(spec)?;
                tracing::info!(task = task.name, job_id = job.job_id, "scheduled task launched job");
                true
            }
            LaunchDecision::Skip(reason) => {
                tracing::debug!(task = task.name, reason, "scheduled task skipped");
                false
            }
        };

        let now = Utc::now();
        let next_run = self.next_run_after(&task.cron_expression, now)?;
        let writer = self.store.writer_guard()?;
        writer.execute(
            "UPDATE scheduled_tasks SET last_run = ?1, last_success = ?1, next_run = ?2,
                                        retry_count = 0, updated_at = ?1 WHERE name = ?3",
            params![now.to_rfc3339(), next_run, task.name],
        )?;
        Ok(launched)
    }

    /// Count a launcher error; disable the task at the retry budget
    fn record_task_error(&self, task: &ScheduledTask, error: &EngineError) -> Result<()> {
        let retry_count = task.retry_count + 1;
        let disable = retry_count >= task.max_retries;
        if disable {
            tracing::warn!(task = task.name, error = %error, "scheduled task disabled after repeated failures");
        } else {
            tracing::warn!(task = task.name, retry_count, error = %error, "scheduled task launcher failed");
        }

        let now = Utc::now();
        let next_run = self.next_run_after(&task.cron_expression, now)?;
        let writer = self.store.writer_guard()?;
        writer.execute(
            "UPDATE scheduled_tasks SET last_run = ?1, next_run = ?2, retry_count = ?3,
                                        enabled = ?4, updated_at = ?1 WHERE name = ?5",
            params![now.to_rfc3339(), next_run, retry_count, !disable, task.name],
        )?;
        Ok(())
    }

    fn next_run_after(&self, cron_expression: &str, after: DateTime<Utc>) -> Result<Option<String>> {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            EngineError::Internal(format!("invalid cron expression {:?}: {}", cron_expression, e))
        })?;
        Ok(schedule.after(&after).next().map(|dt| dt.to_rfc3339()))
    }

    /// Current scheduled task rows
    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM scheduled_tasks ORDER BY name")?;
        let rows = stmt
            .query_map([], Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Peek at a single task
    pub fn get_task(&self, name: &str) -> Result<Option<ScheduledTask>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM scheduled_tasks WHERE name = ?1")?;
        Ok(stmt
            .query_row(params![name], Self::row_to_task)
            .optional()?)
    }
}
