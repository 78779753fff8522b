//! Durable Job Queue
//!
//! SQLite-backed queue with atomic enqueue, conditional-update claims
//! ordered by creation time, append-only progress events with a cached
//! latest snapshot, bounded retries, and a broadcast channel streaming job
//! events to interested readers (poll fallback via `events_since`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::jobs::{CancelFlag, Job, JobSpec, JobStatus, JobType};
use crate::storage::GraphStore;

/// Broadcast channel capacity; slow readers fall back to polling
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One streamed job event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub seq: i64,
    /// Status name or progress stage
    pub stage: String,
    pub message: String,
    pub fraction: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Durable job queue over the relational layer
pub struct JobQueue {
    store: Arc<GraphStore>,
    events: broadcast::Sender<JobEvent>,
    /// Cancel flags of jobs currently processing in this process
    running: Mutex<HashMap<String, CancelFlag>>,
}

impl JobQueue {
    pub fn new(store: Arc<GraphStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the live job event stream
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, job_id: &str, seq: i64, stage: &str, message: &str, fraction: Option<f64>) {
        let _ = self.events.send(JobEvent {
            job_id: job_id.to_string(),
            seq,
            stage: stage.to_string(),
            message: message.to_string(),
            fraction,
            created_at: Utc::now(),
        });
    }

    // ========================================================================
    // ENQUEUE & TRANSITIONS
    // ========================================================================

    /// Atomically enqueue a job
    ///
    /// Auto-approved specs enter as `approved`; everything else as
    /// `pending` until pre-analysis or an approver moves them.
    pub fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        let job_id = format!("j_{}", Uuid::new_v4().simple());
        let status = if spec.auto_approve {
            JobStatus::Approved
        } else {
            JobStatus::Pending
        };
        let now = Utc::now().to_rfc3339();

        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "INSERT INTO jobs (job_id, job_type, status, job_source, is_system_job, job_data,
                                   retry_count, max_retries, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)",
                params![
                    job_id,
                    spec.job_type.as_str(),
                    status.as_str(),
                    spec.job_source.as_str(),
                    spec.is_system_job,
                    serde_json::to_string(&spec.job_data)?,
                    spec.max_retries,
                    now
                ],
            )?;
        }

        self.emit(&job_id, 0, status.as_str(), "enqueued", None);
        self.get_job(&job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    /// Guarded status transition; fails with `Conflict` when the state
    /// machine forbids the move or the row changed underneath
    fn transition(&self, job_id: &str, from: &[JobStatus], to: JobStatus) -> Result<Job> {
        for status in from {
            debug_assert!(status.can_transition_to(to));
        }
        let placeholders: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
        let sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE job_id = ?3 AND status IN ({})",
            placeholders.join(", ")
        );

        let changed = {
            let writer = self.store.writer_guard()?;
            writer.execute(&sql, params![to.as_str(), Utc::now().to_rfc3339(), job_id])?
        };
        if changed == 0 {
            let current = self
                .get_job(job_id)?
                .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
            return Err(EngineError::Conflict(format!(
                "job {} is {}, cannot move to {}",
                job_id, current.status, to
            )));
        }

        self.emit(job_id, 0, to.as_str(), "", None);
        self.get_job(job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    /// Record pre-analysis and gate the job behind approval
    pub fn mark_awaiting_approval(&self, job_id: &str, analysis: serde_json::Value) -> Result<Job> {
        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET analysis = ?1, updated_at = ?2 WHERE job_id = ?3",
                params![
                    serde_json::to_string(&analysis)?,
                    Utc::now().to_rfc3339(),
                    job_id
                ],
            )?;
        }
        self.transition(job_id, &[JobStatus::Pending], JobStatus::AwaitingApproval)
    }

    /// Approve a pending or gated job
    pub fn approve(&self, job_id: &str, approver: &str) -> Result<Job> {
        let job = self.transition(
            job_id,
            &[JobStatus::Pending, JobStatus::AwaitingApproval],
            JobStatus::Approved,
        )?;
        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET approved_by = ?1 WHERE job_id = ?2",
                params![approver, job_id],
            )?;
        }
        Ok(job)
    }

    /// Cancel a job
    ///
    /// Pre-processing jobs move straight to cancelled. A processing job
    /// cannot jump states; its cancel flag is raised instead and the worker
    /// finishes the transition cooperatively. Terminal jobs conflict.
    pub fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self
            .get_job(job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;

        if job.status.is_cancellable() {
            return self.transition(job_id, &[job.status], JobStatus::Cancelled);
        }
        if job.status == JobStatus::Processing {
            if let Some(flag) = self.running.lock().expect("running set lock poisoned").get(job_id) {
                flag.cancel();
            }
            return Ok(job);
        }
        Err(EngineError::Conflict(format!(
            "job {} is already {}",
            job_id, job.status
        )))
    }

    // ========================================================================
    // CLAIMING
    // ========================================================================

    /// Claim the oldest runnable job for a worker
    ///
    /// Conditional update pending|approved|queued -> processing; ties
    /// broken by oldest `created_at`. Returns the claimed job and its
    /// cancel flag, or None when the queue is empty.
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<(Job, CancelFlag)>> {
        let claimed_id: Option<String> = {
            let writer = self.store.writer_guard()?;
            let tx = writer.unchecked_transaction()?;
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM jobs
                     WHERE status IN ('pending', 'approved', 'queued')
                     ORDER BY created_at, job_id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            match candidate {
                Some(job_id) => {
                    let changed = tx.execute(
                        "UPDATE jobs SET status = 'processing', claimed_by = ?1,
                                        started_at = ?2, updated_at = ?2
                         WHERE job_id = ?3 AND status IN ('pending', 'approved', 'queued')",
                        params![worker_id, Utc::now().to_rfc3339(), job_id],
                    )?;
                    tx.commit()?;
                    (changed == 1).then_some(job_id)
                }
                None => None,
            }
        };

        let Some(job_id) = claimed_id else {
            return Ok(None);
        };

        let flag = CancelFlag::new();
        self.running
            .lock()
            .expect("running set lock poisoned")
            .insert(job_id.clone(), flag.clone());
        self.emit(&job_id, 0, "processing", worker_id, None);

        let job = self
            .get_job(&job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
        Ok(Some((job, flag)))
    }

    fn unregister(&self, job_id: &str) {
        self.running.lock().expect("running set lock poisoned").remove(job_id);
    }

    // ========================================================================
    // PROGRESS
    // ========================================================================

    /// Append a progress event and refresh the cached snapshot
    ///
    /// Fractions are monotonic: a value below the last recorded one is
    /// clamped up to it.
    pub fn record_progress(
        &self,
        job_id: &str,
        stage: &str,
        message: &str,
        fraction: Option<f64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let (seq, fraction) = {
            let writer = self.store.writer_guard()?;
            let tx = writer.unchecked_transaction()?;

            let last: (i64, Option<f64>) = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0), MAX(fraction) FROM job_events WHERE job_id = ?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap_or((0, None));
            let seq = last.0 + 1;
            let fraction = match (fraction, last.1) {
                (Some(f), Some(prev)) => Some(f.max(prev)),
                (f, _) => f,
            };

            tx.execute(
                "INSERT INTO job_events (job_id, seq, stage, message, fraction, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job_id, seq, stage, message, fraction, now],
            )?;
            let snapshot = serde_json::json!({
                "stage": stage,
                "message": message,
                "fraction": fraction,
                "updatedAt": now,
            });
            tx.execute(
                "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE job_id = ?3",
                params![serde_json::to_string(&snapshot)?, now, job_id],
            )?;
            tx.commit()?;
            (seq, fraction)
        };

        self.emit(job_id, seq, stage, message, fraction);
        Ok(())
    }

    /// Events after `after_seq`, oldest first (poll fallback)
    pub fn events_since(&self, job_id: &str, after_seq: i64) -> Result<Vec<JobEvent>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT seq, stage, message, fraction, created_at FROM job_events
             WHERE job_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![job_id, after_seq], |row| {
                Ok(JobEvent {
                    job_id: job_id.to_string(),
                    seq: row.get(0)?,
                    stage: row.get(1)?,
                    message: row.get(2)?,
                    fraction: row.get(3)?,
                    created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// Mark a processing job completed
    pub fn complete(&self, job_id: &str, result: Option<serde_json::Value>) -> Result<Job> {
        let job = self.transition(job_id, &[JobStatus::Processing], JobStatus::Completed)?;
        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET finished_at = ?1, progress = COALESCE(?2, progress)
                 WHERE job_id = ?3",
                params![
                    Utc::now().to_rfc3339(),
                    result.map(|r| serde_json::to_string(&r)).transpose()?,
                    job_id
                ],
            )?;
        }
        self.unregister(job_id);
        Ok(job)
    }

    /// Mark a processing job cancelled (cooperative path)
    pub fn mark_cancelled(&self, job_id: &str) -> Result<Job> {
        let job = self.transition(job_id, &[JobStatus::Processing], JobStatus::Cancelled)?;
        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET finished_at = ?1 WHERE job_id = ?2",
                params![Utc::now().to_rfc3339(), job_id],
            )?;
        }
        self.unregister(job_id);
        Ok(job)
    }

    /// Record a failure
    ///
    /// Retryable errors under the retry budget re-enter the queue as
    /// approved; everything else lands in terminal failed with the error
    /// class and a truncated message.
    pub fn fail(&self, job_id: &str, error: &EngineError) -> Result<Job> {
        let job = self
            .get_job(job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
        let retry_count = job.retry_count + 1;
        let retry = error.is_retryable() && retry_count < job.max_retries;

        {
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET retry_count = ?1, error_code = ?2, error_message = ?3,
                                updated_at = ?4 WHERE job_id = ?5",
                params![
                    retry_count,
                    error.code(),
                    error.truncated_message(240),
                    Utc::now().to_rfc3339(),
                    job_id
                ],
            )?;
        }

        let job = if retry {
            tracing::warn!(job_id, retry_count, error = %error, "job failed, requeueing");
            self.transition(job_id, &[JobStatus::Processing], JobStatus::Approved)?
        } else {
            let failed = self.transition(job_id, &[JobStatus::Processing], JobStatus::Failed)?;
            let writer = self.store.writer_guard()?;
            writer.execute(
                "UPDATE jobs SET finished_at = ?1 WHERE job_id = ?2",
                params![Utc::now().to_rfc3339(), job_id],
            )?;
            failed
        };
        self.unregister(job_id);
        Ok(job)
    }

    // ========================================================================
    // READS
    // ========================================================================

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let parse_ts = |value: String| {
            DateTime::parse_from_rfc3339(&value)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        let status: String = row.get("status")?;
        let job_type: String = row.get("job_type")?;
        let job_source: String = row.get("job_source")?;
        let job_data: String = row.get("job_data")?;
        let analysis: Option<String> = row.get("analysis")?;
        let progress: Option<String> = row.get("progress")?;

        Ok(Job {
            job_id: row.get("job_id")?,
            job_type: job_type.parse().unwrap_or(JobType::Ingest),
            status: status.parse().unwrap_or_default(),
            job_source: job_source.parse().unwrap_or_default(),
            is_system_job: row.get("is_system_job")?,
            job_data: serde_json::from_str(&job_data).unwrap_or(serde_json::Value::Null),
            analysis: analysis.and_then(|a| serde_json::from_str(&a).ok()),
            progress: progress.and_then(|p| serde_json::from_str(&p).ok()),
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            created_at: parse_ts(row.get::<_, String>("created_at")?),
            updated_at: parse_ts(row.get::<_, String>("updated_at")?),
            started_at: row.get::<_, Option<String>>("started_at")?.map(&parse_ts),
            finished_at: row.get::<_, Option<String>>("finished_at")?.map(&parse_ts),
            approved_by: row.get("approved_by")?,
            claimed_by: row.get("claimed_by")?,
        })
    }

    /// Get a job by id
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM jobs WHERE job_id = ?1")?;
        Ok(stmt
            .query_row(params![job_id], Self::row_to_job)
            .optional()?)
    }

    /// List jobs, newest first, optionally filtered by status
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM jobs WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                Self::row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, Precision};

    fn setup() -> (tempfile::TempDir, Arc<GraphStore>, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: "static-test".into(),
            model_name: "m".into(),
            dimension: 4,
            precision: Precision::Float32,
        };
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config).unwrap(),
        );
        let queue = JobQueue::new(Arc::clone(&store));
        (dir, store, queue)
    }

    fn spec() -> JobSpec {
        JobSpec::user(JobType::Ingest, serde_json::json!({"document": "doc.md"}))
    }

    #[test]
    fn test_enqueue_and_claim_oldest_first() {
        let (_dir, _store, queue) = setup();
        let first = queue.enqueue(spec()).unwrap();
        let second = queue.enqueue(spec()).unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        let (claimed, _) = queue.claim_next("worker-1").unwrap().unwrap();
        assert_eq!(claimed.job_id, first.job_id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

        let (claimed, _) = queue.claim_next("worker-2").unwrap().unwrap();
        assert_eq!(claimed.job_id, second.job_id);

        assert!(queue.claim_next("worker-3").unwrap().is_none());
    }

    #[test]
    fn test_approval_gate_flow() {
        let (_dir, _store, queue) = setup();
        let job = queue.enqueue(spec()).unwrap();

        let gated = queue
            .mark_awaiting_approval(&job.job_id, serde_json::json!({"chunks": 40}))
            .unwrap();
        assert_eq!(gated.status, JobStatus::AwaitingApproval);
        assert!(gated.analysis.is_some());

        // Gated jobs are not claimable
        assert!(queue.claim_next("w").unwrap().is_none());

        let approved = queue.approve(&job.job_id, "reviewer").unwrap();
        assert_eq!(approved.status, JobStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("reviewer"));

        let (claimed, _) = queue.claim_next("w").unwrap().unwrap();
        assert_eq!(claimed.job_id, job.job_id);
    }

    #[test]
    fn test_auto_approved_jobs_skip_the_gate() {
        let (_dir, _store, queue) = setup();
        let job = queue
            .enqueue(JobSpec::system(
                JobType::RefreshHotViews,
                serde_json::json!({}),
            ))
            .unwrap();
        assert_eq!(job.status, JobStatus::Approved);
    }

    #[test]
    fn test_cancel_rules() {
        let (_dir, _store, queue) = setup();

        // Pre-processing: straight to cancelled
        let job = queue.enqueue(spec()).unwrap();
        let cancelled = queue.cancel(&job.job_id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // Cancelled is terminal
        assert!(matches!(
            queue.cancel(&job.job_id),
            Err(EngineError::Conflict(_))
        ));

        // Processing: cancel raises the cooperative flag
        let job = queue.enqueue(spec()).unwrap();
        let (_, flag) = queue.claim_next("w").unwrap().unwrap();
        assert!(!flag.is_cancelled());
        let still_processing = queue.cancel(&job.job_id).unwrap();
        assert_eq!(still_processing.status, JobStatus::Processing);
        assert!(flag.is_cancelled());

        // The worker finishes the transition
        let done = queue.mark_cancelled(&job.job_id).unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_retry_budget() {
        let (_dir, _store, queue) = setup();
        let job = queue.enqueue(spec()).unwrap();

        // First failure with a retryable error: requeued
        queue.claim_next("w").unwrap().unwrap();
        let after = queue
            .fail(&job.job_id, &EngineError::ProviderUnavailable("503".into()))
            .unwrap();
        assert_eq!(after.status, JobStatus::Approved);
        assert_eq!(after.retry_count, 1);

        // Second failure exhausts max_retries = 2
        queue.claim_next("w").unwrap().unwrap();
        let after = queue
            .fail(&job.job_id, &EngineError::ProviderUnavailable("503".into()))
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.error_code.as_deref(), Some("provider_unavailable"));
    }

    #[test]
    fn test_non_retryable_error_fails_immediately() {
        let (_dir, _store, queue) = setup();
        let job = queue.enqueue(spec()).unwrap();
        queue.claim_next("w").unwrap().unwrap();

        let after = queue
            .fail(&job.job_id, &EngineError::Integrity("hash mismatch".into()))
            .unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.error_code.as_deref(), Some("integrity_error"));
    }

    #[test]
    fn test_progress_is_monotonic_and_streamed() {
        let (_dir, _store, queue) = setup();
        let mut events = queue.subscribe();
        let job = queue.enqueue(spec()).unwrap();

        queue
            .record_progress(&job.job_id, "chunk", "1/4", Some(0.25))
            .unwrap();
        queue
            .record_progress(&job.job_id, "chunk", "2/4", Some(0.5))
            .unwrap();
        // A regressing fraction is clamped up, never backwards
        queue
            .record_progress(&job.job_id, "chunk", "late event", Some(0.1))
            .unwrap();

        let stored = queue.events_since(&job.job_id, 0).unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].fraction, Some(0.5));
        assert!(stored.windows(2).all(|w| w[0].seq < w[1].seq));

        // Live stream saw the enqueue plus three progress events
        let mut streamed = 0;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id, job.job_id);
            streamed += 1;
        }
        assert_eq!(streamed, 4);

        let snapshot = queue.get_job(&job.job_id).unwrap().unwrap().progress.unwrap();
        assert_eq!(snapshot["fraction"], serde_json::json!(0.5));
    }

    #[test]
    fn test_complete_is_terminal() {
        let (_dir, _store, queue) = setup();
        let job = queue.enqueue(spec()).unwrap();
        queue.claim_next("w").unwrap().unwrap();
        let done = queue
            .complete(&job.job_id, Some(serde_json::json!({"chunks": 3})))
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(matches!(
            queue.complete(&job.job_id, None),
            Err(EngineError::Conflict(_))
        ));
    }
}
