//! Semantic Search
//!
//! Concept and source-passage retrieval over the vector indexes, with
//! query-embedding caching and query-time hash verification. Staleness is
//! surfaced as a flag, never as a failure; slice-hash corruption is the one
//! fatal case.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConfigRegistry;
use crate::embeddings::{ChunkFreshness, EmbeddingService};
use crate::error::Result;
use crate::graph::{ChunkStrategy, Concept};
use crate::storage::GraphStore;

/// Meta flag read by the regeneration launcher
pub const REGEN_REQUESTED_KEY: &str = "regen_requested";

/// One concept hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptSearchResult {
    pub concept: Concept,
    pub similarity: f32,
}

/// One source-passage hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSearchResult {
    pub source_id: String,
    pub ontology: String,
    pub document: String,
    pub chunk_index: i64,
    pub strategy: ChunkStrategy,
    pub chunk_text: String,
    pub similarity: f32,
    /// Source text changed since this chunk was embedded
    pub stale: bool,
    /// Concepts evidenced in the source, when requested
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub concepts: Vec<Concept>,
}

/// Semantic search over concepts and source passages
pub struct SearchApi {
    store: Arc<GraphStore>,
    embeddings: Arc<EmbeddingService>,
    config: Arc<ConfigRegistry>,
}

impl SearchApi {
    pub fn new(
        store: Arc<GraphStore>,
        embeddings: Arc<EmbeddingService>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            store,
            embeddings,
            config,
        }
    }

    /// Semantic concept search
    ///
    /// `min_similarity` defaults to the configured search threshold, which
    /// is independent of the concept-merge threshold. `ontology` restricts
    /// hits to concepts with evidence in that namespace.
    pub async fn search_concepts(
        &self,
        query: &str,
        limit: usize,
        min_similarity: Option<f32>,
        ontology: Option<&str>,
        offset: usize,
    ) -> Result<Vec<ConceptSearchResult>> {
        let threshold =
            min_similarity.unwrap_or(self.config.settings().search_min_similarity);
        let vector = self.embeddings.embed_query(query).await?;

        // Over-fetch to survive offsetting and ontology filtering
        let fetch = (limit + offset) * 2 + 8;
        let hits = self.store.knn_concepts(&vector, fetch, threshold)?;

        let mut results = Vec::new();
        for (concept_id, similarity) in hits {
            if let Some(namespace) = ontology {
                if !self.concept_in_ontology(&concept_id, namespace)? {
                    continue;
                }
            }
            let Some(concept) = self.store.get_concept(&concept_id)? else {
                continue;
            };
            results.push(ConceptSearchResult {
                concept,
                similarity,
            });
        }

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    fn concept_in_ontology(&self, concept_id: &str, ontology: &str) -> Result<bool> {
        let reader = self.store.reader_guard()?;
        let found: Option<i64> = {
            use rusqlite::OptionalExtension;
            reader
                .query_row(
                    "SELECT 1 FROM instances i
                     JOIN sources s ON s.source_id = i.source_id
                     WHERE i.concept_id = ?1 AND s.ontology = ?2
                     LIMIT 1",
                    rusqlite::params![concept_id, ontology],
                    |row| row.get(0),
                )
                .optional()?
        };
        Ok(found.is_some())
    }

    /// Semantic source-passage search
    ///
    /// Each hit is hash-verified against the current source text. Stale
    /// hits are returned flagged, and a regeneration request is recorded
    /// for the scheduler. A chunk failing its own slice hash aborts the
    /// query with an integrity error after quarantining the row.
    pub async fn search_sources(
        &self,
        query: &str,
        ontology: Option<&str>,
        limit: usize,
        include_concepts: bool,
    ) -> Result<Vec<SourceSearchResult>> {
        let threshold = self.config.settings().search_min_similarity;
        let vector = self.embeddings.embed_query(query).await?;
        let hits = self.store.knn_source_chunks(&vector, limit * 2 + 8, threshold)?;

        let mut results = Vec::new();
        let mut saw_stale = false;

        for (source_id, chunk_index, strategy, similarity) in hits {
            if results.len() >= limit {
                break;
            }
            let strategy: ChunkStrategy = match strategy.parse() {
                Ok(s) => s,
                Err(_) => continue,
            };
            let Some(source) = self.store.get_source(&source_id)? else {
                continue;
            };
            if let Some(namespace) = ontology {
                if source.ontology != namespace {
                    continue;
                }
            }
            let Some(chunk) = self
                .store
                .get_source_chunk(&source_id, chunk_index, strategy)?
            else {
                continue;
            };

            let stale = match self.embeddings.check_chunk(&chunk, &source.full_text)? {
                ChunkFreshness::Fresh => false,
                ChunkFreshness::Stale => {
                    saw_stale = true;
                    true
                }
            };

            let concepts = if include_concepts {
                self.concepts_for_source(&source_id)?
            } else {
                Vec::new()
            };

            results.push(SourceSearchResult {
                source_id,
                ontology: source.ontology,
                document: source.document,
                chunk_index,
                strategy,
                chunk_text: chunk.chunk_text,
                similarity,
                stale,
                concepts,
            });
        }

        if saw_stale {
            self.store.meta_set(REGEN_REQUESTED_KEY, "1")?;
        }
        Ok(results)
    }

    fn concepts_for_source(&self, source_id: &str) -> Result<Vec<Concept>> {
        let concept_ids: Vec<String> = {
            let reader = self.store.reader_guard()?;
            let mut stmt = reader.prepare(
                "SELECT DISTINCT concept_id FROM instances WHERE source_id = ?1",
            )?;
            stmt.query_map(rusqlite::params![source_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut concepts = Vec::new();
        for concept_id in concept_ids {
            if let Some(concept) = self.store.get_concept(&concept_id)? {
                concepts.push(concept);
            }
        }
        Ok(concepts)
    }
}
