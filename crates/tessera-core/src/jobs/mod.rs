//! Jobs & Scheduling
//!
//! Durable units of work with an explicit state machine, a SQLite-backed
//! queue, a single-leader scheduler with conditional launchers, and the
//! worker pool that executes claimed jobs.

pub mod launchers;
mod queue;
mod scheduler;
mod worker;

pub use launchers::{LaunchContext, LaunchDecision, Launcher};
pub use queue::{JobEvent, JobQueue};
pub use scheduler::{Scheduler, acquire_advisory_lock};
pub use worker::{JobRouter, JobWorker};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative cancellation flag shared between a job and its controller
///
/// Jobs check the flag between chunks; in-flight provider calls run to
/// completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ============================================================================
// JOB STATUS
// ============================================================================

/// Job lifecycle status
///
/// Transitions are forward-only; terminal statuses never move again.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    AwaitingApproval,
    Approved,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Convert to the stored string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Approved => "approved",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the status never changes again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a cancel request may move this status straight to cancelled
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending
                | JobStatus::AwaitingApproval
                | JobStatus::Approved
                | JobStatus::Queued
        )
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingApproval)
                | (Pending, Approved)
                | (Pending, Queued)
                | (Pending, Cancelled)
                // Direct worker claim without an explicit queued hop
                | (Pending, Processing)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Cancelled)
                | (Approved, Queued)
                | (Approved, Cancelled)
                | (Approved, Processing)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                // Retry path: a failed attempt under budget re-enters the queue
                | (Processing, Approved)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "awaiting_approval" => Ok(JobStatus::AwaitingApproval),
            "approved" => Ok(JobStatus::Approved),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

// ============================================================================
// JOB SOURCE & TYPE
// ============================================================================

/// Who created a job
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    #[default]
    User,
    ScheduledTask,
    Triggered,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::User => "user",
            JobSource::ScheduledTask => "scheduled_task",
            JobSource::Triggered => "triggered",
        }
    }
}

impl std::str::FromStr for JobSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(JobSource::User),
            "scheduled_task" => Ok(JobSource::ScheduledTask),
            "triggered" => Ok(JobSource::Triggered),
            _ => Err(format!("Unknown job source: {}", s)),
        }
    }
}

/// What a job does
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Ingest,
    Regenerate,
    ConsolidateVocab,
    MeasureRoles,
    AnnealingCycle,
    AnnealingExecute,
    RefreshHotViews,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ingest => "ingest",
            JobType::Regenerate => "regenerate",
            JobType::ConsolidateVocab => "consolidate_vocab",
            JobType::MeasureRoles => "measure_roles",
            JobType::AnnealingCycle => "annealing_cycle",
            JobType::AnnealingExecute => "annealing_execute",
            JobType::RefreshHotViews => "refresh_hot_views",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(JobType::Ingest),
            "regenerate" => Ok(JobType::Regenerate),
            "consolidate_vocab" => Ok(JobType::ConsolidateVocab),
            "measure_roles" => Ok(JobType::MeasureRoles),
            "annealing_cycle" => Ok(JobType::AnnealingCycle),
            "annealing_execute" => Ok(JobType::AnnealingExecute),
            "refresh_hot_views" => Ok(JobType::RefreshHotViews),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

// ============================================================================
// JOB
// ============================================================================

/// A durable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub job_source: JobSource,
    pub is_system_job: bool,
    /// Structured input for the handler
    pub job_data: serde_json::Value,
    /// Cost/size estimate produced by pre-analysis
    pub analysis: Option<serde_json::Value>,
    /// Latest progress snapshot
    pub progress: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub claimed_by: Option<String>,
}

/// Parameters for enqueueing a job
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: JobType,
    pub job_source: JobSource,
    pub is_system_job: bool,
    pub job_data: serde_json::Value,
    /// Enter the queue pre-approved, skipping any gate
    pub auto_approve: bool,
    pub max_retries: i64,
}

impl JobSpec {
    /// A system job that needs no approval
    pub fn system(job_type: JobType, job_data: serde_json::Value) -> Self {
        Self {
            job_type,
            job_source: JobSource::ScheduledTask,
            is_system_job: true,
            job_data,
            auto_approve: true,
            max_retries: 2,
        }
    }

    /// A user-submitted job subject to the approval gate
    pub fn user(job_type: JobType, job_data: serde_json::Value) -> Self {
        Self {
            job_type,
            job_source: JobSource::User,
            is_system_job: false,
            job_data,
            auto_approve: false,
            max_retries: 2,
        }
    }
}

/// A scheduled task row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub name: String,
    pub cron_expression: String,
    /// Launcher evaluated when the task fires
    pub launcher: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub max_retries: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::AwaitingApproval,
            JobStatus::Approved,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Pending,
                JobStatus::Approved,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_only_pre_processing_statuses_are_cancellable() {
        assert!(JobStatus::Pending.is_cancellable());
        assert!(JobStatus::AwaitingApproval.is_cancellable());
        assert!(JobStatus::Approved.is_cancellable());
        assert!(JobStatus::Queued.is_cancellable());
        assert!(!JobStatus::Processing.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
        assert!(!JobStatus::Failed.is_cancellable());
    }

    #[test]
    fn test_forward_only_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::AwaitingApproval));
        assert!(JobStatus::AwaitingApproval.can_transition_to(JobStatus::Approved));
        assert!(JobStatus::Approved.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));

        // No going backwards
        assert!(!JobStatus::Approved.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
