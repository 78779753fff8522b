//! Unified Embedding Service
//!
//! One service covers the three embedding namespaces (concepts, source
//! chunks, vocabulary) under the single active model. Handles cold-start
//! vocabulary initialization, incremental source embedding with dual hash
//! pinning, coverage verification, and checkpointed full regeneration.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use lru::LruCache;
use rusqlite::params;

use crate::config::ConfigRegistry;
use crate::embeddings::{chunking, normalize_in_place};
use crate::error::{EngineError, Result};
use crate::graph::{ChunkStrategy, SourceChunk, sha256_hex};
use crate::jobs::CancelFlag;
use crate::providers::{EmbeddingProvider, RetryPolicy, with_retries};
use crate::storage::GraphStore;

/// Query-embedding LRU capacity
const QUERY_CACHE_SIZE: usize = 100;

/// Batch size for regeneration passes
const REGEN_BATCH_SIZE: usize = 32;

// ============================================================================
// REPORT TYPES
// ============================================================================

/// Scope of a regeneration run
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenScope {
    Concept,
    Source,
    Vocab,
    All,
}

impl RegenScope {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RegenScope::Concept => "concept",
            RegenScope::Source => "source",
            RegenScope::Vocab => "vocab",
            RegenScope::All => "all",
        }
    }
}

impl std::str::FromStr for RegenScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "concept" => Ok(RegenScope::Concept),
            "source" => Ok(RegenScope::Source),
            "vocab" => Ok(RegenScope::Vocab),
            "all" => Ok(RegenScope::All),
            _ => Err(format!("Unknown regeneration scope: {}", s)),
        }
    }
}

/// Coverage counts for one embedding namespace
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceCoverage {
    pub total: i64,
    /// Rows with an embedding of the active dimension
    pub with_embedding: i64,
    /// Rows whose embedding exists but no longer matches the active dimension
    pub stale: i64,
}

impl NamespaceCoverage {
    pub fn missing(&self) -> i64 {
        self.total - self.with_embedding
    }
}

/// Result of [`EmbeddingService::verify`]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub dimension: usize,
    pub model: String,
    pub concepts: NamespaceCoverage,
    pub source_chunks: NamespaceCoverage,
    pub vocab_types: NamespaceCoverage,
    /// All active vocabulary types are embedded under the active dimension
    pub ready_for_grounding: bool,
}

impl CoverageReport {
    /// Total stale rows across namespaces
    pub fn stale_total(&self) -> i64 {
        self.concepts.stale + self.source_chunks.stale + self.vocab_types.stale
    }
}

/// Result of a regeneration run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenReport {
    pub scope: RegenScope,
    pub model: String,
    pub processed: usize,
    pub skipped: usize,
}

/// Freshness of a source chunk at query time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFreshness {
    Fresh,
    /// Source text changed since the chunk was embedded
    Stale,
}

// ============================================================================
// EMBEDDING SERVICE
// ============================================================================

/// Generates, verifies and regenerates embeddings across all namespaces
pub struct EmbeddingService {
    store: Arc<GraphStore>,
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<ConfigRegistry>,
    retry: RetryPolicy,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(
        store: Arc<GraphStore>,
        provider: Arc<dyn EmbeddingProvider>,
        registry: Arc<ConfigRegistry>,
    ) -> Self {
        let retry = RetryPolicy {
            call_timeout: registry.settings().provider_call_timeout,
            ..Default::default()
        };
        Self {
            store,
            provider,
            registry,
            retry,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Embed one text into a unit-norm vector of the active dimension
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let outputs = self.embed_batch(&texts).await?;
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Internal("provider returned empty batch".into()))
    }

    /// Embed a batch into unit-norm vectors of the active dimension
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dimension = self.registry.dimension();
        let outputs = with_retries(&self.retry, "embed_batch", || {
            let texts = texts.to_vec();
            let provider = Arc::clone(&self.provider);
            async move { provider.embed_batch(&texts).await }
        })
        .await?;

        let mut vectors = Vec::with_capacity(outputs.len());
        for output in outputs {
            if output.vector.len() != dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: dimension,
                    actual: output.vector.len(),
                });
            }
            let mut vector = output.vector;
            normalize_in_place(&mut vector);
            vectors.push(vector);
        }
        Ok(vectors)
    }

    /// Embed a search query with LRU caching
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self
            .query_cache
            .lock()
            .map_err(|_| EngineError::Internal("query cache lock poisoned".into()))?
            .get(query)
        {
            return Ok(cached.clone());
        }
        let vector = self.embed(query).await?;
        self.query_cache
            .lock()
            .map_err(|_| EngineError::Internal("query cache lock poisoned".into()))?
            .put(query.to_string(), vector.clone());
        Ok(vector)
    }

    /// Drop cached query embeddings (after any model change)
    pub fn clear_query_cache(&self) {
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.clear();
        }
    }

    // ========================================================================
    // VOCABULARY COLD START
    // ========================================================================

    /// Generate embeddings for every active vocabulary type missing one
    ///
    /// Idempotent: types already embedded under the active dimension are
    /// untouched. Returns the number generated.
    pub async fn initialize_builtin_vocab(&self) -> Result<usize> {
        let dimension = self.registry.dimension();
        let model = self.registry.embedding().model_name;
        let pending: Vec<(String, String)> = self
            .store
            .list_vocab_types(true)?
            .into_iter()
            .filter(|vt| !vt.has_embedding_of_dimension(dimension))
            .map(|vt| (vt.name, vt.description))
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        let mut generated = 0usize;
        for batch in pending.chunks(REGEN_BATCH_SIZE) {
            let texts: Vec<String> = batch
                .iter()
                .map(|(name, description)| vocab_embedding_text(name, description))
                .collect();
            let vectors = self.embed_batch(&texts).await?;
            for ((name, _), vector) in batch.iter().zip(vectors) {
                self.store.set_vocab_embedding(name, &vector, &model)?;
                generated += 1;
            }
        }

        tracing::info!(generated, "initialized vocabulary embeddings");
        Ok(generated)
    }

    // ========================================================================
    // SOURCE EMBEDDING
    // ========================================================================

    /// Split and embed a source under a strategy
    ///
    /// Records byte offsets plus both hashes (chunk and whole-source) at
    /// generation time. Idempotent per (source, chunk index, strategy): a
    /// fully fresh source is a no-op; changed text re-embeds from scratch.
    pub async fn ensure_source_embedded(
        &self,
        source_id: &str,
        strategy: ChunkStrategy,
    ) -> Result<usize> {
        let source = self
            .store
            .get_source(source_id)?
            .ok_or_else(|| EngineError::NotFound(format!("source {}", source_id)))?;

        let source_hash = sha256_hex(&source.full_text);
        if source.content_hash.is_none() {
            self.store.set_source_content_hash(source_id, &source_hash)?;
        }

        let dimension = self.registry.dimension();
        let existing = self.store.source_chunks(source_id, strategy)?;
        let fresh = !existing.is_empty()
            && existing
                .iter()
                .all(|c| c.source_hash == source_hash && c.dimension == dimension as i64);
        if fresh {
            return Ok(0);
        }
        if !existing.is_empty() {
            self.store.delete_source_chunks(source_id, strategy)?;
        }

        let spans = chunking::split(&source.full_text, strategy);
        if spans.is_empty() {
            return Ok(0);
        }

        let model = self.registry.embedding().model_name;
        let mut written = 0usize;
        for batch in spans.chunks(REGEN_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();
            let vectors = self.embed_batch(&texts).await?;
            for (span, vector) in batch.iter().zip(vectors) {
                let chunk = SourceChunk {
                    source_id: source_id.to_string(),
                    chunk_index: span.index as i64,
                    strategy,
                    start_offset: span.start_offset as i64,
                    end_offset: span.end_offset as i64,
                    chunk_text: span.text.clone(),
                    chunk_hash: sha256_hex(&span.text),
                    source_hash: source_hash.clone(),
                    embedding: vector,
                    model: model.clone(),
                    dimension: dimension as i64,
                    created_at: Utc::now(),
                };
                if self.store.insert_source_chunk(&chunk)? {
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    /// Query-time freshness check for a chunk
    ///
    /// A source-hash mismatch is survivable: the chunk is reported stale and
    /// the caller schedules regeneration. A chunk-hash mismatch against the
    /// pinned slice means the stored row itself is corrupt: the chunk is
    /// quarantined and the error is fatal.
    pub fn check_chunk(&self, chunk: &SourceChunk, current_full_text: &str) -> Result<ChunkFreshness> {
        if chunk.source_hash != sha256_hex(current_full_text) {
            return Ok(ChunkFreshness::Stale);
        }

        let start = chunk.start_offset as usize;
        let end = chunk.end_offset as usize;
        let slice_ok = current_full_text
            .get(start..end)
            .map(|slice| sha256_hex(slice) == chunk.chunk_hash)
            .unwrap_or(false);
        if !slice_ok {
            self.store
                .quarantine_source_chunk(&chunk.source_id, chunk.chunk_index, chunk.strategy)?;
            return Err(EngineError::Integrity(format!(
                "chunk {}:{} hash mismatch against pinned slice",
                chunk.source_id, chunk.chunk_index
            )));
        }
        Ok(ChunkFreshness::Fresh)
    }

    // ========================================================================
    // VERIFY
    // ========================================================================

    /// Coverage report across all namespaces under the active dimension
    pub fn verify(&self) -> Result<CoverageReport> {
        let config = self.registry.embedding();
        let dimension = config.dimension as i64;
        let reader = self.store.reader_guard()?;

        let concepts = NamespaceCoverage {
            total: reader.query_row("SELECT COUNT(*) FROM concepts", [], |r| r.get(0))?,
            with_embedding: reader.query_row(
                "SELECT COUNT(*) FROM concept_embeddings WHERE dimension = ?1",
                params![dimension],
                |r| r.get(0),
            )?,
            stale: reader.query_row(
                "SELECT COUNT(*) FROM concept_embeddings WHERE dimension != ?1",
                params![dimension],
                |r| r.get(0),
            )?,
        };

        let source_chunks = NamespaceCoverage {
            total: reader.query_row(
                "SELECT COUNT(*) FROM source_embeddings WHERE quarantined = 0",
                [],
                |r| r.get(0),
            )?,
            with_embedding: reader.query_row(
                "SELECT COUNT(*) FROM source_embeddings WHERE quarantined = 0 AND dimension = ?1",
                params![dimension],
                |r| r.get(0),
            )?,
            stale: reader.query_row(
                "SELECT COUNT(*) FROM source_embeddings WHERE quarantined = 0 AND dimension != ?1",
                params![dimension],
                |r| r.get(0),
            )?,
        };

        let vocab_types = NamespaceCoverage {
            total: reader.query_row(
                "SELECT COUNT(*) FROM vocab_types WHERE is_active = 1",
                [],
                |r| r.get(0),
            )?,
            with_embedding: reader.query_row(
                "SELECT COUNT(*) FROM vocab_types
                 WHERE is_active = 1 AND embedding_dimension = ?1",
                params![dimension],
                |r| r.get(0),
            )?,
            stale: reader.query_row(
                "SELECT COUNT(*) FROM vocab_types
                 WHERE is_active = 1 AND embedding IS NOT NULL AND embedding_dimension != ?1",
                params![dimension],
                |r| r.get(0),
            )?,
        };

        let ready_for_grounding =
            vocab_types.total > 0 && vocab_types.with_embedding == vocab_types.total;

        Ok(CoverageReport {
            dimension: config.dimension,
            model: config.model_name,
            concepts,
            source_chunks,
            vocab_types,
            ready_for_grounding,
        })
    }

    // ========================================================================
    // REGENERATE
    // ========================================================================

    /// Regenerate embeddings for a scope, batched and checkpointed
    ///
    /// Resumable: progress is checkpointed in `system_meta` per scope, so a
    /// failed run continues where it stopped. The model is pinned at scope
    /// start; a configuration swap mid-run aborts with `Conflict` rather
    /// than mixing models within the scope.
    pub async fn regenerate(
        &self,
        scope: RegenScope,
        cancel: &CancelFlag,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<RegenReport> {
        let report = match scope {
            RegenScope::Concept => self.regenerate_concepts(cancel, &mut progress).await?,
            RegenScope::Source => self.regenerate_sources(cancel, &mut progress).await?,
            RegenScope::Vocab => self.regenerate_vocab(cancel, &mut progress).await?,
            RegenScope::All => {
                let concepts = self.regenerate_concepts(cancel, &mut progress).await?;
                let sources = self.regenerate_sources(cancel, &mut progress).await?;
                let vocab = self.regenerate_vocab(cancel, &mut progress).await?;
                RegenReport {
                    scope: RegenScope::All,
                    model: vocab.model,
                    processed: concepts.processed + sources.processed + vocab.processed,
                    skipped: concepts.skipped + sources.skipped + vocab.skipped,
                }
            }
        };
        tracing::info!(
            scope = scope.as_str(),
            processed = report.processed,
            "regeneration complete"
        );
        Ok(report)
    }

    fn checkpoint_key(scope: RegenScope) -> String {
        format!("regen_checkpoint_{}", scope.as_str())
    }

    fn guard_generation(&self, pinned: u64) -> Result<()> {
        if self.registry.embedding_generation() != pinned {
            return Err(EngineError::Conflict(
                "embedding configuration changed during regeneration".to_string(),
            ));
        }
        Ok(())
    }

    async fn regenerate_concepts(
        &self,
        cancel: &CancelFlag,
        progress: &mut impl FnMut(usize, usize),
    ) -> Result<RegenReport> {
        let generation = self.registry.embedding_generation();
        let model = self.registry.embedding().model_name;
        let checkpoint_key = Self::checkpoint_key(RegenScope::Concept);
        let checkpoint = self.store.meta_get(&checkpoint_key)?.unwrap_or_default();

        let all: Vec<(String, String)> = {
            let reader = self.store.reader_guard()?;
            let mut stmt =
                reader.prepare("SELECT concept_id, label FROM concepts ORDER BY concept_id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let total = all.len();
        let pending: Vec<(String, String)> = all
            .into_iter()
            .filter(|(id, _)| id.as_str() > checkpoint.as_str())
            .collect();
        let skipped = total - pending.len();

        let mut processed = skipped;
        for batch in pending.chunks(REGEN_BATCH_SIZE) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.guard_generation(generation)?;

            let texts: Vec<String> = batch.iter().map(|(_, label)| label.clone()).collect();
            let vectors = self.embed_batch(&texts).await?;
            let updates: Vec<(String, Vec<f32>)> = batch
                .iter()
                .map(|(id, _)| id.clone())
                .zip(vectors)
                .collect();
            self.store.bulk_update_concept_embeddings(&updates, &model)?;

            if let Some((last_id, _)) = batch.last() {
                self.store.meta_set(&checkpoint_key, last_id)?;
            }
            processed += batch.len();
            progress(processed, total);
        }

        self.store.meta_set(&checkpoint_key, "")?;
        Ok(RegenReport {
            scope: RegenScope::Concept,
            model,
            processed: processed - skipped,
            skipped,
        })
    }

    async fn regenerate_sources(
        &self,
        cancel: &CancelFlag,
        progress: &mut impl FnMut(usize, usize),
    ) -> Result<RegenReport> {
        let generation = self.registry.embedding_generation();
        let model = self.registry.embedding().model_name;
        let checkpoint_key = Self::checkpoint_key(RegenScope::Source);
        let checkpoint = self.store.meta_get(&checkpoint_key)?.unwrap_or_default();

        let all = self.store.all_source_ids()?;
        let total = all.len();
        let pending: Vec<String> = all
            .into_iter()
            .filter(|id| id.as_str() > checkpoint.as_str())
            .collect();
        let skipped = total - pending.len();

        let mut processed = skipped;
        for source_id in pending {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.guard_generation(generation)?;

            // Preserve whichever strategies the source was embedded under;
            // default to paragraph for sources never embedded at all.
            let strategies: Vec<ChunkStrategy> = {
                let reader = self.store.reader_guard()?;
                let mut stmt = reader.prepare(
                    "SELECT DISTINCT chunk_strategy FROM source_embeddings WHERE source_id = ?1",
                )?;
                let found: Vec<String> = stmt
                    .query_map(params![source_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                if found.is_empty() {
                    vec![ChunkStrategy::Paragraph]
                } else {
                    found.iter().filter_map(|s| s.parse().ok()).collect()
                }
            };

            for strategy in strategies {
                self.store.delete_source_chunks(&source_id, strategy)?;
                self.ensure_source_embedded(&source_id, strategy).await?;
            }

            self.store.meta_set(&checkpoint_key, &source_id)?;
            processed += 1;
            progress(processed, total);
        }

        self.store.meta_set(&checkpoint_key, "")?;
        Ok(RegenReport {
            scope: RegenScope::Source,
            model,
            processed: processed - skipped,
            skipped,
        })
    }

    async fn regenerate_vocab(
        &self,
        cancel: &CancelFlag,
        progress: &mut impl FnMut(usize, usize),
    ) -> Result<RegenReport> {
        let generation = self.registry.embedding_generation();
        let model = self.registry.embedding().model_name;

        let types: Vec<(String, String)> = self
            .store
            .list_vocab_types(true)?
            .into_iter()
            .map(|vt| (vt.name, vt.description))
            .collect();
        let total = types.len();

        let mut processed = 0usize;
        for batch in types.chunks(REGEN_BATCH_SIZE) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.guard_generation(generation)?;

            let texts: Vec<String> = batch
                .iter()
                .map(|(name, description)| vocab_embedding_text(name, description))
                .collect();
            let vectors = self.embed_batch(&texts).await?;
            for ((name, _), vector) in batch.iter().zip(vectors) {
                self.store.set_vocab_embedding(name, &vector, &model)?;
            }
            processed += batch.len();
            progress(processed, total);
        }

        Ok(RegenReport {
            scope: RegenScope::Vocab,
            model,
            processed,
            skipped: 0,
        })
    }
}

/// Text embedded for a vocabulary type
fn vocab_embedding_text(name: &str, description: &str) -> String {
    if description.is_empty() {
        name.to_string()
    } else {
        format!("{}: {}", name, description)
    }
}
