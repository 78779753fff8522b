//! Job Worker
//!
//! Claims jobs from the durable queue and dispatches them by type to the
//! owning engine. Each worker runs one job at a time under the per-job
//! time budget; cooperative cancellation is observed between work units
//! and terminal status is always written back.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::annealing::AnnealingManager;
use crate::config::ConfigRegistry;
use crate::embeddings::{EmbeddingService, RegenScope};
use crate::error::{EngineError, Result};
use crate::grounding::GroundingEngine;
use crate::ingest::IngestPipeline;
use crate::jobs::launchers::INGEST_EPOCH_KEY;
use crate::jobs::{CancelFlag, Job, JobQueue, JobStatus, JobType};
use crate::storage::GraphStore;
use crate::vocab::{VocabConsolidator, VocabRegistry, measure_roles, run_classification};

/// Idle poll interval when the queue is empty
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Hot-view cache size maintained by the refresh job
const HOT_VIEW_LIMIT: usize = 100;

/// Dispatches claimed jobs to the engines that execute them
pub struct JobRouter {
    pub store: Arc<GraphStore>,
    pub config: Arc<ConfigRegistry>,
    pub vocab: Arc<VocabRegistry>,
    pub embeddings: Arc<EmbeddingService>,
    pub grounding: Arc<GroundingEngine>,
    pub pipeline: Arc<IngestPipeline>,
    pub consolidator: Arc<VocabConsolidator>,
    pub annealing: Arc<AnnealingManager>,
}

impl JobRouter {
    /// Execute one job; the returned value becomes the final progress
    pub async fn handle(
        &self,
        job: &Job,
        queue: &JobQueue,
        cancel: &CancelFlag,
    ) -> Result<serde_json::Value> {
        match job.job_type {
            JobType::Ingest => {
                let report = self.pipeline.run(job, queue, cancel).await?;
                // New edges shift grounding for their targets
                self.grounding.invalidate_all();
                Ok(serde_json::to_value(report)?)
            }
            JobType::Regenerate => {
                let scope = job
                    .job_data
                    .get("scope")
                    .and_then(|s| s.as_str())
                    .map(RegenScope::from_str)
                    .transpose()
                    .map_err(EngineError::Internal)?
                    .unwrap_or(RegenScope::All);

                let report = self
                    .embeddings
                    .regenerate(scope, cancel, |done, total| {
                        let fraction = if total == 0 {
                            1.0
                        } else {
                            done as f64 / total as f64
                        };
                        let _ = queue.record_progress(
                            &job.job_id,
                            "regenerate",
                            &format!("{}/{}", done, total),
                            Some(fraction),
                        );
                    })
                    .await?;

                // Fresh embeddings invalidate everything derived from them
                self.vocab.reload()?;
                self.grounding.invalidate_all();
                self.embeddings.clear_query_cache();
                Ok(serde_json::to_value(report)?)
            }
            JobType::ConsolidateVocab => {
                let target = job
                    .job_data
                    .get("target")
                    .and_then(|t| t.as_u64())
                    .map(|t| t as usize)
                    .unwrap_or(self.config.settings().consolidate_target);
                let report = self.consolidator.consolidate(target, false).await?;
                self.grounding.invalidate_all();
                Ok(serde_json::to_value(report)?)
            }
            JobType::MeasureRoles => {
                // Re-classify categories first: role measurement reads the
                // snapshot classification writes
                let settings = self.config.settings();
                let classified = run_classification(
                    &self.store,
                    &self.vocab,
                    settings.category_ambiguity_threshold,
                )?;
                let axis = self.grounding.polarity_axis()?;
                let measured = measure_roles(
                    &self.store,
                    &self.vocab,
                    axis.as_deref(),
                    settings.role_sample_size,
                )?;
                Ok(serde_json::json!({ "measured": measured, "classified": classified }))
            }
            JobType::AnnealingCycle => {
                let epoch = match job.job_data.get("epoch").and_then(|e| e.as_i64()) {
                    Some(epoch) => epoch,
                    None => self.store.meta_i64(INGEST_EPOCH_KEY)?,
                };
                let report = self.annealing.run_cycle(queue, epoch).await?;
                Ok(serde_json::to_value(report)?)
            }
            JobType::AnnealingExecute => {
                let proposal_id = job
                    .job_data
                    .get("proposalId")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| {
                        EngineError::Internal("annealing_execute needs a proposalId".into())
                    })?;
                self.annealing.execute_proposal(proposal_id)?;
                Ok(serde_json::json!({ "executed": proposal_id }))
            }
            JobType::RefreshHotViews => {
                let (concepts, edges) = self.store.refresh_hot_views(HOT_VIEW_LIMIT)?;
                Ok(serde_json::json!({ "hotConcepts": concepts, "hotEdges": edges }))
            }
        }
    }
}

/// One queue-consuming worker
pub struct JobWorker {
    queue: Arc<JobQueue>,
    router: Arc<JobRouter>,
    worker_id: String,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, router: Arc<JobRouter>, worker_id: impl Into<String>) -> Self {
        Self {
            queue,
            router,
            worker_id: worker_id.into(),
        }
    }

    /// Consume the queue until shutdown
    pub async fn run(&self, shutdown: CancelFlag) {
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                Err(e) => {
                    tracing::warn!(worker = self.worker_id, "worker iteration failed: {}", e);
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
    }

    /// Claim and execute at most one job; returns its terminal status
    pub async fn run_once(&self) -> Result<Option<JobStatus>> {
        let Some((job, cancel)) = self.queue.claim_next(&self.worker_id)? else {
            return Ok(None);
        };
        tracing::info!(
            worker = self.worker_id,
            job_id = job.job_id,
            job_type = job.job_type.as_str(),
            "job claimed"
        );

        let budget = self.config_job_timeout();
        let outcome =
            tokio::time::timeout(budget, self.router.handle(&job, &self.queue, &cancel)).await;

        let status = match outcome {
            Ok(Ok(result)) => {
                if cancel.is_cancelled() {
                    self.queue.mark_cancelled(&job.job_id)?.status
                } else {
                    self.queue.complete(&job.job_id, Some(result))?.status
                }
            }
            Ok(Err(EngineError::Cancelled)) => self.queue.mark_cancelled(&job.job_id)?.status,
            Ok(Err(error)) => {
                tracing::warn!(job_id = job.job_id, error = %error, "job failed");
                self.queue.fail(&job.job_id, &error)?.status
            }
            Err(_) => {
                let error = EngineError::Timeout(budget);
                tracing::warn!(job_id = job.job_id, "job exceeded its time budget");
                self.queue.fail(&job.job_id, &error)?.status
            }
        };
        Ok(Some(status))
    }

    fn config_job_timeout(&self) -> Duration {
        self.router.config.settings().job_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AiProviderConfig, AutomationLevel, EmbeddingConfig, EngineSettings, Precision,
    };
    use crate::ingest::IngestRequest;
    use crate::jobs::JobSpec;
    use crate::providers::mock::{ScriptedReasoningProvider, StaticEmbeddingProvider, concept};
    use crate::providers::{ExtractionResult, ProviderCapability, ReasoningProvider};
    use crate::vocab::install_builtin_vocab;

    const DIM: usize = 16;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<GraphStore>,
        queue: Arc<JobQueue>,
        reasoning: Arc<ScriptedReasoningProvider>,
        worker: JobWorker,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = EngineSettings::default();
        settings.annealing_automation = AutomationLevel::Hitl;
        let config = Arc::new(ConfigRegistry::new(
            EmbeddingConfig {
                provider: "static-test".into(),
                model_name: "m".into(),
                dimension: DIM,
                precision: Precision::Float32,
            },
            AiProviderConfig {
                provider: "scripted-test".into(),
                model_name: "s".into(),
                capabilities: vec![ProviderCapability::Extract, ProviderCapability::Decide],
            },
            settings,
        ));
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config.embedding()).unwrap(),
        );
        install_builtin_vocab(&store).unwrap();
        let vocab = Arc::new(VocabRegistry::new(Arc::clone(&store)).unwrap());
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::clone(&store),
            Arc::new(StaticEmbeddingProvider::new(DIM)),
            Arc::clone(&config),
        ));
        let reasoning = Arc::new(ScriptedReasoningProvider::new());
        let reasoning_dyn = Arc::clone(&reasoning) as Arc<dyn ReasoningProvider>;
        let grounding = Arc::new(GroundingEngine::new(
            Arc::clone(&store),
            Arc::clone(&vocab),
            Arc::clone(&config),
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&store),
            Arc::clone(&embeddings),
            Arc::clone(&reasoning_dyn),
            Arc::clone(&vocab),
            Arc::clone(&config),
        ));
        let consolidator = Arc::new(VocabConsolidator::new(
            Arc::clone(&store),
            Arc::clone(&vocab),
            Arc::clone(&reasoning_dyn),
        ));
        let annealing = Arc::new(AnnealingManager::new(
            Arc::clone(&store),
            Arc::clone(&reasoning_dyn),
            Arc::clone(&config),
        ));
        let queue = Arc::new(JobQueue::new(Arc::clone(&store)));
        let router = Arc::new(JobRouter {
            store: Arc::clone(&store),
            config,
            vocab,
            embeddings,
            grounding,
            pipeline,
            consolidator,
            annealing,
        });
        let worker = JobWorker::new(Arc::clone(&queue), router, "worker-test");
        Fixture {
            _dir: dir,
            store,
            queue,
            reasoning,
            worker,
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let f = setup();
        assert!(f.worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_job_runs_to_completion() {
        let f = setup();
        f.reasoning.push_extraction(ExtractionResult {
            concepts: vec![concept("Alpha", "alpha is here")],
            ..Default::default()
        });
        let request = IngestRequest {
            ontology: "default".into(),
            document: "doc.md".into(),
            text: "Alpha appears in this text.".into(),
            auto_approve: true,
            ..Default::default()
        };
        let mut spec = JobSpec::user(JobType::Ingest, serde_json::to_value(&request).unwrap());
        spec.auto_approve = true;
        let job = f.queue.enqueue(spec).unwrap();

        let status = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);

        let stored = f.queue.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.finished_at.is_some());
        assert_eq!(f.store.engine_stats().unwrap().concepts, 1);
    }

    #[tokio::test]
    async fn test_invalid_job_data_fails_terminally() {
        let f = setup();
        // Missing ontology and text: the pipeline rejects it outright
        let job = f
            .queue
            .enqueue(JobSpec::system(JobType::Ingest, serde_json::json!({})))
            .unwrap();

        let status = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Failed);
        let stored = f.queue.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.error_code.as_deref(), Some("internal"));
    }

    #[tokio::test]
    async fn test_refresh_hot_views_job() {
        let f = setup();
        f.store
            .upsert_concept(
                "Alpha",
                &[],
                &Arc::new(StaticEmbeddingProvider::new(DIM)).vector_for("Alpha"),
                None,
                0.99,
            )
            .unwrap();
        f.queue
            .enqueue(JobSpec::system(
                JobType::RefreshHotViews,
                serde_json::json!({}),
            ))
            .unwrap();

        let status = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_measure_roles_job_resets_change_counter() {
        let f = setup();
        f.store.meta_set("vocab_change_counter", "12").unwrap();
        f.queue
            .enqueue(JobSpec::system(JobType::MeasureRoles, serde_json::json!({})))
            .unwrap();

        let status = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(f.store.meta_i64("vocab_change_counter").unwrap(), 0);

        // With no embedded axis, every non-temporal type is insufficient data
        let vt = f.store.get_vocab_type("SUPPORTS").unwrap().unwrap();
        assert_eq!(
            vt.semantic_role,
            crate::vocab::SemanticRole::InsufficientData
        );
        let temporal = f.store.get_vocab_type("PRECEDES").unwrap().unwrap();
        assert_eq!(temporal.semantic_role, crate::vocab::SemanticRole::Historical);
    }

    #[tokio::test]
    async fn test_regenerate_job_reports_progress() {
        let f = setup();
        f.queue
            .enqueue(JobSpec::system(
                JobType::Regenerate,
                serde_json::json!({ "scope": "vocab" }),
            ))
            .unwrap();

        let status = f.worker.run_once().await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);

        // All 30 builtins now carry embeddings of the active dimension
        let report = f.worker.router.embeddings.verify().unwrap();
        assert!(report.ready_for_grounding);
        assert_eq!(report.vocab_types.with_embedding, 30);
    }
}
