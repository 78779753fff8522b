//! Scheduled-Task Launchers
//!
//! A launcher is the cheap condition attached to a scheduled task: every
//! firing evaluates it, and only a passing condition enqueues the real job.
//! A failing condition is a *skip*, never an error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConfigRegistry;
use crate::embeddings::EmbeddingService;
use crate::error::Result;
use crate::jobs::{JobSpec, JobType};
use crate::search::REGEN_REQUESTED_KEY;
use crate::storage::GraphStore;
use crate::vocab::VocabRegistry;

/// Meta keys for the consolidation hysteresis and annealing epoch tracking
pub const CONSOLIDATION_ARMED_KEY: &str = "consolidation_armed";
pub const INGEST_EPOCH_KEY: &str = "ingest_epoch";
pub const ANNEALING_LAST_EPOCH_KEY: &str = "annealing_last_epoch";

/// Shared context handed to every launcher
pub struct LaunchContext {
    pub store: Arc<GraphStore>,
    pub registry: Arc<ConfigRegistry>,
    pub vocab: Arc<VocabRegistry>,
    pub embeddings: Arc<EmbeddingService>,
}

/// Outcome of a launcher evaluation
#[derive(Debug, Clone)]
pub enum LaunchDecision {
    /// Condition passed: enqueue this job
    Launch(JobSpec),
    /// Condition failed: record a skip with the reason
    Skip(String),
}

/// A cheap condition deciding whether a scheduled task does real work
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Stable name referenced by `scheduled_tasks.launcher`
    fn name(&self) -> &'static str;

    /// Evaluate the condition
    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision>;
}

// ============================================================================
// ROLE RE-MEASUREMENT
// ============================================================================

/// Re-measure semantic roles once enough vocabulary changes accumulate
pub struct RoleMeasureLauncher;

#[async_trait]
impl Launcher for RoleMeasureLauncher {
    fn name(&self) -> &'static str {
        "measure_roles"
    }

    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision> {
        let threshold = ctx.registry.settings().role_remeasure_threshold;
        let pending = ctx.vocab.pending_changes()?;
        if pending >= threshold {
            Ok(LaunchDecision::Launch(JobSpec::system(
                JobType::MeasureRoles,
                serde_json::json!({ "pendingChanges": pending }),
            )))
        } else {
            Ok(LaunchDecision::Skip(format!(
                "vocabulary change delta {} below threshold {}",
                pending, threshold
            )))
        }
    }
}

// ============================================================================
// CONSOLIDATION (HYSTERESIS)
// ============================================================================

/// Consolidate when the inactive-type ratio leaves the hysteresis band
///
/// Fires when the ratio exceeds the ceiling while armed, then disarms; it
/// re-arms only once the ratio drops under the floor. Ratios inside the
/// band neither fire nor re-arm, which is what stops trigger thrash right
/// after a consolidation run.
pub struct ConsolidationLauncher;

#[async_trait]
impl Launcher for ConsolidationLauncher {
    fn name(&self) -> &'static str {
        "consolidate_vocab"
    }

    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision> {
        let (floor, ceiling) = ctx.registry.settings().consolidate_hysteresis;
        let target = ctx.registry.settings().consolidate_target;
        let ratio = ctx.store.inactive_vocab_ratio()?;
        let armed = ctx
            .store
            .meta_get(CONSOLIDATION_ARMED_KEY)?
            .map(|v| v != "0")
            .unwrap_or(true);

        if ratio > ceiling && armed {
            ctx.store.meta_set(CONSOLIDATION_ARMED_KEY, "0")?;
            return Ok(LaunchDecision::Launch(JobSpec::system(
                JobType::ConsolidateVocab,
                serde_json::json!({ "target": target, "inactiveRatio": ratio }),
            )));
        }
        if ratio < floor && !armed {
            ctx.store.meta_set(CONSOLIDATION_ARMED_KEY, "1")?;
            return Ok(LaunchDecision::Skip(format!(
                "inactive ratio {:.3} under floor, re-armed",
                ratio
            )));
        }
        Ok(LaunchDecision::Skip(format!(
            "inactive ratio {:.3} inside hysteresis band (armed: {})",
            ratio, armed
        )))
    }
}

// ============================================================================
// ANNEALING
// ============================================================================

/// Run an annealing cycle once enough ingest epochs have passed
///
/// The epoch-delta check is what prevents double runs when both the cron
/// firing and a post-ingestion trigger race for the same cycle.
pub struct AnnealingLauncher;

#[async_trait]
impl Launcher for AnnealingLauncher {
    fn name(&self) -> &'static str {
        "annealing_cycle"
    }

    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision> {
        let interval = ctx.registry.settings().annealing_interval_epochs;
        let current = ctx.store.meta_i64(INGEST_EPOCH_KEY)?;
        let last = ctx.store.meta_i64(ANNEALING_LAST_EPOCH_KEY)?;
        let delta = current - last;

        if delta >= interval {
            Ok(LaunchDecision::Launch(JobSpec::system(
                JobType::AnnealingCycle,
                serde_json::json!({ "epoch": current }),
            )))
        } else {
            Ok(LaunchDecision::Skip(format!(
                "epoch delta {} below interval {}",
                delta, interval
            )))
        }
    }
}

// ============================================================================
// REGENERATION SWEEP
// ============================================================================

/// Regenerate when query paths flagged stale rows or coverage shows them
pub struct RegenerationLauncher;

#[async_trait]
impl Launcher for RegenerationLauncher {
    fn name(&self) -> &'static str {
        "regenerate"
    }

    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision> {
        let requested = ctx
            .store
            .meta_get(REGEN_REQUESTED_KEY)?
            .map(|v| v == "1")
            .unwrap_or(false);
        let stale = ctx.embeddings.verify()?.stale_total();

        if requested || stale > 0 {
            ctx.store.meta_set(REGEN_REQUESTED_KEY, "0")?;
            Ok(LaunchDecision::Launch(JobSpec::system(
                JobType::Regenerate,
                serde_json::json!({ "scope": "all", "staleRows": stale }),
            )))
        } else {
            Ok(LaunchDecision::Skip("no stale embeddings".to_string()))
        }
    }
}

// ============================================================================
// HOT VIEWS
// ============================================================================

/// Refresh the hot-view caches whenever the graph has content
pub struct HotViewLauncher;

#[async_trait]
impl Launcher for HotViewLauncher {
    fn name(&self) -> &'static str {
        "refresh_hot_views"
    }

    async fn evaluate(&self, ctx: &LaunchContext) -> Result<LaunchDecision> {
        let stats = ctx.store.engine_stats()?;
        if stats.concepts == 0 {
            return Ok(LaunchDecision::Skip("graph is empty".to_string()));
        }
        Ok(LaunchDecision::Launch(JobSpec::system(
            JobType::RefreshHotViews,
            serde_json::json!({}),
        )))
    }
}

/// The default launcher set, keyed by name
pub fn default_launchers() -> Vec<Arc<dyn Launcher>> {
    vec![
        Arc::new(RoleMeasureLauncher),
        Arc::new(ConsolidationLauncher),
        Arc::new(AnnealingLauncher),
        Arc::new(RegenerationLauncher),
        Arc::new(HotViewLauncher),
    ]
}
