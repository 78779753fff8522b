//! Ingestion Pipeline
//!
//! Turns a submitted document into graph state: preprocess, chunk,
//! extract, embed, upsert. Chunks process sequentially in document order;
//! cancellation is checked between chunks; deterministic ids make a
//! resumed or retried job converge on the same vertices instead of
//! duplicating them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ConfigRegistry;
use crate::embeddings::EmbeddingService;
use crate::error::{EngineError, Result};
use crate::graph::{ChunkStrategy, ConceptSeed, Source, sha256_hex, source_id_for};
use crate::ingest::chunker::{IngestChunk, chunk_words};
use crate::ingest::preprocess::Preprocessor;
use crate::jobs::launchers::INGEST_EPOCH_KEY;
use crate::jobs::{CancelFlag, Job, JobQueue};
use crate::providers::{ExtractionResult, ReasoningProvider, RetryPolicy, with_retries};
use crate::storage::GraphStore;
use crate::vocab::VocabRegistry;

/// Most-recent concept labels offered to the extractor as link targets
const KNOWN_CONCEPT_CONTEXT: usize = 50;

// ============================================================================
// REQUEST / REPORT TYPES
// ============================================================================

/// Ingestion input carried in `job_data`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestRequest {
    pub ontology: String,
    pub document: String,
    pub text: String,
    /// Re-process chunks whose content hash already exists
    pub force: bool,
    /// Caller vouches for the cost; still subject to the size threshold
    pub auto_approve: bool,
    /// Run markdown preprocessing before chunking
    pub markdown: bool,
}

/// Pre-analysis estimate for the approval gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAnalysis {
    pub chunk_count: usize,
    /// Extraction plus embedding calls, roughly
    pub estimated_provider_calls: usize,
    pub requires_approval: bool,
}

/// Result of a completed ingestion job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// Every chunk was already present and `force` was off
    pub duplicate: bool,
    pub chunks_processed: usize,
    pub chunks_skipped_duplicate: usize,
    pub sources_created: usize,
    pub concepts_created: usize,
    pub concepts_merged: usize,
    pub instances_created: usize,
    pub edges_created: usize,
    pub skipped_relationships: usize,
    pub unresolved_endpoints: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Document-to-graph ingestion pipeline
pub struct IngestPipeline {
    store: Arc<GraphStore>,
    embeddings: Arc<EmbeddingService>,
    reasoning: Arc<dyn ReasoningProvider>,
    vocab: Arc<VocabRegistry>,
    config: Arc<ConfigRegistry>,
    preprocessor: Preprocessor,
    retry: RetryPolicy,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<GraphStore>,
        embeddings: Arc<EmbeddingService>,
        reasoning: Arc<dyn ReasoningProvider>,
        vocab: Arc<VocabRegistry>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        let settings = config.settings();
        let preprocessor = Preprocessor::new(Arc::clone(&reasoning), settings.preprocess_permits);
        let retry = RetryPolicy {
            call_timeout: settings.provider_call_timeout,
            ..Default::default()
        };
        Self {
            store,
            embeddings,
            reasoning,
            vocab,
            config,
            preprocessor,
            retry,
        }
    }

    /// Estimate cost for the approval gate
    pub fn analyze(&self, request: &IngestRequest) -> IngestAnalysis {
        let settings = self.config.settings();
        let words = request.text.split_whitespace().count();
        let step = settings
            .ingest_target_words
            .saturating_sub(settings.ingest_overlap_words)
            .max(1);
        let chunk_count = if words == 0 {
            0
        } else {
            1 + words.saturating_sub(settings.ingest_target_words).div_ceil(step)
        };

        let requires_approval = if settings.ingest_auto_approve {
            false
        } else {
            chunk_count > settings.approval_chunk_threshold || !request.auto_approve
        };

        IngestAnalysis {
            chunk_count,
            // One extraction per chunk plus one embedding batch per chunk
            estimated_provider_calls: chunk_count * 2,
            requires_approval,
        }
    }

    /// Execute an approved ingestion job
    pub async fn run(
        &self,
        job: &Job,
        queue: &JobQueue,
        cancel: &CancelFlag,
    ) -> Result<IngestReport> {
        let request: IngestRequest = serde_json::from_value(job.job_data.clone())?;
        if request.ontology.is_empty() || request.text.trim().is_empty() {
            return Err(EngineError::Internal(
                "ingest request needs an ontology and text".to_string(),
            ));
        }

        self.store.ensure_ontology(&request.ontology)?;

        queue.record_progress(&job.job_id, "preprocess", &request.document, Some(0.0))?;
        let prose = if request.markdown {
            self.preprocessor.preprocess(&request.text).await?
        } else {
            request.text.clone()
        };

        let settings = self.config.settings();
        let chunks = chunk_words(
            &prose,
            settings.ingest_target_words,
            settings.ingest_overlap_words,
        );
        let total = chunks.len();
        let mut report = IngestReport::default();
        // Labels resolved so far in this document, lowercased
        let mut label_ids: HashMap<String, String> = HashMap::new();

        for chunk in &chunks {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.process_chunk(&request, chunk, queue, job, &mut label_ids, &mut report)
                .await?;

            let fraction = (chunk.index + 1) as f64 / total.max(1) as f64;
            queue.record_progress(
                &job.job_id,
                "chunk",
                &format!("{}/{}", chunk.index + 1, total),
                Some(fraction),
            )?;
        }

        report.duplicate =
            !request.force && total > 0 && report.chunks_skipped_duplicate == total;

        // Post-ingestion: advance the epoch counters the annealing launcher
        // watches, unless this was a pure duplicate no-op
        if !report.duplicate {
            self.store.meta_incr(INGEST_EPOCH_KEY, 1)?;
            self.store.bump_ontology_epoch(&request.ontology)?;
        }

        tracing::info!(
            job_id = job.job_id,
            document = request.document,
            chunks = report.chunks_processed,
            concepts = report.concepts_created,
            edges = report.edges_created,
            duplicate = report.duplicate,
            "ingestion complete"
        );
        Ok(report)
    }

    /// Extract, embed and upsert one chunk
    async fn process_chunk(
        &self,
        request: &IngestRequest,
        chunk: &IngestChunk,
        queue: &JobQueue,
        job: &Job,
        label_ids: &mut HashMap<String, String>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let chunk_hash = sha256_hex(&chunk.text);
        let source_id = source_id_for(&chunk_hash, chunk.index);

        // Duplicate detection within the ontology by content hash
        if let Some(existing) = self
            .store
            .find_source_by_hash(&request.ontology, &chunk_hash)?
        {
            if !request.force {
                report.chunks_skipped_duplicate += 1;
                queue.record_progress(
                    &job.job_id,
                    "duplicate",
                    &format!("chunk {} already ingested as {}", chunk.index, existing.source_id),
                    None,
                )?;
                return Ok(());
            }
        } else {
            self.store.insert_source(&Source {
                source_id: source_id.clone(),
                ontology: request.ontology.clone(),
                document: request.document.clone(),
                paragraph: chunk.index as i64,
                full_text: chunk.text.clone(),
                content_hash: Some(chunk_hash.clone()),
                created_at: Utc::now(),
            })?;
            report.sources_created += 1;
        }
        let source_id = self
            .store
            .find_source_by_hash(&request.ontology, &chunk_hash)?
            .map(|s| s.source_id)
            .unwrap_or(source_id);

        // Extraction with known-concept and known-type context
        let known_concepts: Vec<String> = self
            .store
            .list_concepts(KNOWN_CONCEPT_CONTEXT as i64, 0)?
            .into_iter()
            .map(|c| c.label)
            .collect();
        let known_types = self.vocab.snapshot().active_names();

        let extraction = with_retries(&self.retry, "extract", || {
            let reasoning = Arc::clone(&self.reasoning);
            let text = chunk.text.clone();
            let known_concepts = known_concepts.clone();
            let known_types = known_types.clone();
            async move {
                reasoning
                    .extract(&text, &known_concepts, &known_types)
                    .await
            }
        })
        .await?;

        self.apply_extraction(&extraction, &chunk_hash, &source_id, chunk, label_ids, report)
            .await?;

        // Index the source text for passage retrieval
        self.embeddings
            .ensure_source_embedded(&source_id, ChunkStrategy::Paragraph)
            .await?;

        report.chunks_processed += 1;
        Ok(())
    }

    /// Write extraction results: concepts, instances, edges
    async fn apply_extraction(
        &self,
        extraction: &ExtractionResult,
        chunk_hash: &str,
        source_id: &str,
        chunk: &IngestChunk,
        label_ids: &mut HashMap<String, String>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let settings = self.config.settings();

        // Embed every proposed label in one batch
        let labels: Vec<String> = extraction.concepts.iter().map(|c| c.label.clone()).collect();
        let vectors = if labels.is_empty() {
            Vec::new()
        } else {
            self.embeddings.embed_batch(&labels).await?
        };

        for (ordinal, (proposal, vector)) in
            extraction.concepts.iter().zip(vectors).enumerate()
        {
            let seed = ConceptSeed {
                content_hash: chunk_hash.to_string(),
                chunk_index: ordinal,
            };
            let outcome = self.store.upsert_concept(
                &proposal.label,
                &proposal.search_terms,
                &vector,
                Some(&seed),
                settings.merge_similarity_threshold,
            )?;
            if outcome.merged {
                report.concepts_merged += 1;
            } else {
                report.concepts_created += 1;
            }
            label_ids.insert(proposal.label.to_lowercase(), outcome.concept_id.clone());

            self.store.add_instance(
                &outcome.concept_id,
                source_id,
                &proposal.quote,
                chunk.index as i64,
            )?;
            report.instances_created += 1;
        }

        // Edges for known active types only; unknown types are captured
        // for curators, never written
        let snapshot = self.vocab.snapshot();
        for skipped in &extraction.skipped_types {
            self.store.record_skipped_relationship(
                skipped,
                &format!("extractor proposed {} in {}", skipped, source_id),
            )?;
            report.skipped_relationships += 1;
        }

        for proposal in &extraction.relationships {
            if !snapshot.is_active(&proposal.rel_type) {
                self.store.record_skipped_relationship(
                    &proposal.rel_type,
                    &format!(
                        "{} {} {} (source {})",
                        proposal.src_label, proposal.rel_type, proposal.dst_label, source_id
                    ),
                )?;
                report.skipped_relationships += 1;
                continue;
            }

            let src = self.resolve_endpoint(&proposal.src_label, label_ids).await?;
            let dst = self.resolve_endpoint(&proposal.dst_label, label_ids).await?;
            let (Some(src), Some(dst)) = (src, dst) else {
                report.unresolved_endpoints += 1;
                continue;
            };

            if self.store.add_edge(
                &src,
                &proposal.rel_type,
                &dst,
                proposal.confidence,
                Some(source_id),
            )? {
                report.edges_created += 1;
            }
        }
        Ok(())
    }

    /// Resolve a relationship endpoint label to a concept id
    ///
    /// Checks this document's upserts first, then nearest-neighbor match at
    /// the merge threshold against existing concepts.
    async fn resolve_endpoint(
        &self,
        label: &str,
        label_ids: &HashMap<String, String>,
    ) -> Result<Option<String>> {
        if let Some(concept_id) = label_ids.get(&label.to_lowercase()) {
            return Ok(Some(concept_id.clone()));
        }
        let settings = self.config.settings();
        let vector = self.embeddings.embed(label).await?;
        let hit = self
            .store
            .knn_concepts(&vector, 1, settings.merge_similarity_threshold)?
            .into_iter()
            .next();
        Ok(hit.map(|(concept_id, _)| concept_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiProviderConfig, EmbeddingConfig, EngineSettings, Precision};
    use crate::jobs::{JobSpec, JobType};
    use crate::providers::ProviderCapability;
    use crate::providers::mock::{
        ScriptedReasoningProvider, StaticEmbeddingProvider, concept, relationship,
    };
    use crate::vocab::install_builtin_vocab;

    const DIM: usize = 32;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<GraphStore>,
        queue: JobQueue,
        reasoning: Arc<ScriptedReasoningProvider>,
        pipeline: IngestPipeline,
    }

    fn setup(settings: EngineSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
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
        let queue = JobQueue::new(Arc::clone(&store));
        let pipeline = IngestPipeline::new(
            Arc::clone(&store),
            embeddings,
            Arc::clone(&reasoning) as Arc<dyn ReasoningProvider>,
            vocab,
            config,
        );
        Fixture {
            _dir: dir,
            store,
            queue,
            reasoning,
            pipeline,
        }
    }

    fn request(text: &str) -> IngestRequest {
        IngestRequest {
            ontology: "default".into(),
            document: "doc.md".into(),
            text: text.into(),
            force: false,
            auto_approve: true,
            markdown: false,
        }
    }

    fn enqueue(fixture: &Fixture, request: &IngestRequest) -> Job {
        let mut spec = JobSpec::user(
            JobType::Ingest,
            serde_json::to_value(request).unwrap(),
        );
        spec.auto_approve = true;
        fixture.queue.enqueue(spec).unwrap()
    }

    #[test]
    fn test_analysis_gates_on_size_and_consent() {
        let f = setup(EngineSettings::default());
        let words = vec!["word"; 30 * 800].join(" ");

        // Caller consented but the document is large: gate anyway
        let mut big = request(&words);
        big.auto_approve = true;
        let analysis = f.pipeline.analyze(&big);
        assert!(analysis.chunk_count > 25);
        assert!(analysis.requires_approval);

        // Small document with consent: no gate
        let small = request("a few words only");
        assert!(!f.pipeline.analyze(&small).requires_approval);

        // Small document without consent: gate
        let mut hesitant = request("a few words only");
        hesitant.auto_approve = false;
        assert!(f.pipeline.analyze(&hesitant).requires_approval);

        // Global auto-approve skips the gate entirely
        let mut settings = EngineSettings::default();
        settings.ingest_auto_approve = true;
        let f = setup(settings);
        let mut big = request(&words);
        big.auto_approve = false;
        assert!(!f.pipeline.analyze(&big).requires_approval);
    }

    #[tokio::test]
    async fn test_full_ingest_writes_graph_state() {
        let f = setup(EngineSettings::default());
        f.reasoning.push_extraction(ExtractionResult {
            concepts: vec![
                concept("Recursion", "recursion is discussed"),
                concept("Stack Depth", "stack depth grows"),
            ],
            relationships: vec![relationship("Recursion", "CAUSES", "Stack Depth", 0.9)],
            skipped_types: vec!["CORRELATES_WITH".into()],
        });

        let req = request("Recursion causes stack depth growth in deep call trees.");
        let job = enqueue(&f, &req);
        let cancel = CancelFlag::new();
        let report = f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();

        assert!(!report.duplicate);
        assert_eq!(report.chunks_processed, 1);
        assert_eq!(report.concepts_created, 2);
        assert_eq!(report.instances_created, 2);
        assert_eq!(report.edges_created, 1);
        assert_eq!(report.skipped_relationships, 1);

        // Evidence invariant: instances over the job's sources match the
        // extractor's proposal count
        let sources = f.store.sources_for_ontology("default").unwrap();
        assert_eq!(
            f.store.count_instances_for_sources(&sources).unwrap(),
            report.instances_created as i64
        );

        // The unknown type was captured, not written
        let skipped = f.store.list_skipped_relationships().unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].rel_type, "CORRELATES_WITH");

        // Epoch advanced for the annealing launcher
        assert_eq!(f.store.meta_i64(INGEST_EPOCH_KEY).unwrap(), 1);
        assert_eq!(f.store.get_ontology("default").unwrap().unwrap().epoch, 1);

        // Source text is embedded for passage search
        assert_eq!(
            f.store
                .source_chunks(&sources[0], ChunkStrategy::Paragraph)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reingest_is_duplicate_noop() {
        let f = setup(EngineSettings::default());
        f.reasoning.push_extraction(ExtractionResult {
            concepts: vec![concept("Alpha", "alpha quote")],
            ..Default::default()
        });

        let req = request("The same text twice over.");
        let job = enqueue(&f, &req);
        let cancel = CancelFlag::new();
        let first = f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();
        assert!(!first.duplicate);
        let epoch_after_first = f.store.meta_i64(INGEST_EPOCH_KEY).unwrap();

        let job = enqueue(&f, &req);
        let second = f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.chunks_skipped_duplicate, 1);
        assert_eq!(second.sources_created, 0);
        // A duplicate no-op does not advance the epoch
        assert_eq!(f.store.meta_i64(INGEST_EPOCH_KEY).unwrap(), epoch_after_first);
    }

    #[tokio::test]
    async fn test_cancellation_between_chunks() {
        let f = setup(EngineSettings::default());
        let req = request("some text");
        let job = enqueue(&f, &req);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = f.pipeline.run(&job, &f.queue, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        // Nothing half-written
        assert!(f.store.sources_for_ontology("default").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edge_to_existing_concept_resolves_by_similarity() {
        let f = setup(EngineSettings::default());

        // Seed an existing concept the document will reference
        f.reasoning.push_extraction(ExtractionResult {
            concepts: vec![concept("Garbage Collection", "gc pauses")],
            ..Default::default()
        });
        let seed_req = request("Garbage collection basics.");
        let job = enqueue(&f, &seed_req);
        let cancel = CancelFlag::new();
        f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();

        // New document links a new concept to it by label only
        f.reasoning.push_extraction(ExtractionResult {
            concepts: vec![concept("Heap Pressure", "heap pressure rises")],
            relationships: vec![relationship(
                "Heap Pressure",
                "INFLUENCES",
                "Garbage Collection",
                0.8,
            )],
            ..Default::default()
        });
        let req = request("Heap pressure influences garbage collection timing.");
        let job = enqueue(&f, &req);
        let report = f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();

        assert_eq!(report.edges_created, 1);
        assert_eq!(report.unresolved_endpoints, 0);
        assert_eq!(f.store.count_edges_for_type("INFLUENCES").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_progress_reaches_completion_fraction() {
        let f = setup(EngineSettings::default());
        f.reasoning.push_extraction(ExtractionResult::default());
        let req = request("short document");
        let job = enqueue(&f, &req);
        let cancel = CancelFlag::new();
        f.pipeline.run(&job, &f.queue, &cancel).await.unwrap();

        let events = f.queue.events_since(&job.job_id, 0).unwrap();
        let last_fraction = events.iter().filter_map(|e| e.fraction).fold(0.0, f64::max);
        assert!((last_fraction - 1.0).abs() < 1e-9);
    }
}
