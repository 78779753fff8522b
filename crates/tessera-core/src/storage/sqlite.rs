//! SQLite Graph Store
//!
//! Core storage layer with integrated vector indexes. Uses separate
//! reader/writer connections for interior mutability: all methods take
//! `&self`, making the store `Send + Sync` so services share an
//! `Arc<GraphStore>` without an outer mutex.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{EmbeddingConfig, Precision};
use crate::embeddings::Embedding;
use crate::error::{EngineError, Result};
use crate::graph::{
    Concept, ConceptSeed, Instance, Ontology, Relationship, SkippedRelationship, Source,
    SourceChunk, UpsertOutcome, concept_id_for,
};
use crate::search::vector::VectorIndex;
use crate::storage::{KeyRecord, KeyValidationStatus, RelationshipFilter};
use crate::vocab::{Category, GroundingStats, SemanticRole, VocabType};

/// Whole-engine count snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub concepts: i64,
    pub concepts_with_embedding: i64,
    pub sources: i64,
    pub source_chunks: i64,
    pub instances: i64,
    pub edges: i64,
    pub vocab_types_active: i64,
    pub vocab_types_total: i64,
    pub ontologies: i64,
}

// ============================================================================
// GRAPH STORE
// ============================================================================

/// SQLite-backed property graph with HNSW indexes per embedding namespace
pub struct GraphStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    concept_index: Mutex<VectorIndex>,
    chunk_index: Mutex<VectorIndex>,
}

impl GraphStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store
    ///
    /// `default_embedding` seeds the active embedding configuration on a
    /// fresh database; an existing active row always wins over it.
    pub fn open(db_path: Option<PathBuf>, default_embedding: &EmbeddingConfig) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("io", "tessera", "core").ok_or_else(|| {
                    EngineError::Internal("could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                data_dir.join("tessera.db")
            }
        };

        let writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        let store = Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            concept_index: Mutex::new(VectorIndex::new(
                default_embedding.dimension,
                default_embedding.precision,
            )?),
            chunk_index: Mutex::new(VectorIndex::new(
                default_embedding.dimension,
                default_embedding.precision,
            )?),
        };

        // Persisted active config wins; seed the default on first boot
        let active = match store.active_embedding_config()? {
            Some(config) => config,
            None => {
                store.activate_embedding_config(default_embedding)?;
                default_embedding.clone()
            }
        };
        if active.dimension != default_embedding.dimension {
            store.rebuild_indexes(&active)?;
        } else {
            store.load_embeddings_into_indexes(active.dimension)?;
        }

        Ok(store)
    }

    pub(crate) fn writer_guard(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| EngineError::Internal("writer lock poisoned".into()))
    }

    pub(crate) fn reader_guard(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| EngineError::Internal("reader lock poisoned".into()))
    }

    fn concept_index_guard(&self) -> Result<MutexGuard<'_, VectorIndex>> {
        self.concept_index
            .lock()
            .map_err(|_| EngineError::Internal("concept index lock poisoned".into()))
    }

    fn chunk_index_guard(&self) -> Result<MutexGuard<'_, VectorIndex>> {
        self.chunk_index
            .lock()
            .map_err(|_| EngineError::Internal("chunk index lock poisoned".into()))
    }

    /// The active embedding dimension D
    pub fn dimension(&self) -> usize {
        self.concept_index
            .lock()
            .map(|index| index.dimensions())
            .unwrap_or(0)
    }

    /// Replace both indexes for a new embedding configuration
    ///
    /// Only blobs already matching the new dimension are loaded back;
    /// everything else is stale until regeneration rewrites it.
    pub fn rebuild_indexes(&self, config: &EmbeddingConfig) -> Result<()> {
        {
            let mut index = self.concept_index_guard()?;
            *index = VectorIndex::new(config.dimension, config.precision)?;
        }
        {
            let mut index = self.chunk_index_guard()?;
            *index = VectorIndex::new(config.dimension, config.precision)?;
        }
        self.load_embeddings_into_indexes(config.dimension)
    }

    /// Load stored embedding blobs of the given dimension into the indexes
    fn load_embeddings_into_indexes(&self, dimension: usize) -> Result<()> {
        let concept_rows: Vec<(String, Vec<u8>)> = {
            let reader = self.reader_guard()?;
            let mut stmt =
                reader.prepare("SELECT concept_id, embedding FROM concept_embeddings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        {
            let mut index = self.concept_index_guard()?;
            for (concept_id, bytes) in concept_rows {
                if let Some(embedding) = Embedding::from_bytes(&bytes) {
                    if embedding.dimensions != dimension {
                        continue; // stale under the active config
                    }
                    if let Err(e) = index.add(&concept_id, &embedding.vector) {
                        tracing::warn!("failed to index concept {}: {}", concept_id, e);
                    }
                }
            }
        }

        let chunk_rows: Vec<(String, i64, String, Vec<u8>)> = {
            let reader = self.reader_guard()?;
            let mut stmt = reader.prepare(
                "SELECT source_id, chunk_index, chunk_strategy, embedding
                 FROM source_embeddings WHERE quarantined = 0",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        {
            let mut index = self.chunk_index_guard()?;
            for (source_id, chunk_index, strategy, bytes) in chunk_rows {
                if let Some(embedding) = Embedding::from_bytes(&bytes) {
                    if embedding.dimensions != dimension {
                        continue;
                    }
                    let key = chunk_key(&source_id, chunk_index, &strategy);
                    if let Err(e) = index.add(&key, &embedding.vector) {
                        tracing::warn!("failed to index chunk {}: {}", key, e);
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()))
    }

    // ========================================================================
    // CONCEPTS
    // ========================================================================

    /// Upsert a concept by embedding similarity
    ///
    /// When the nearest existing concept reaches `merge_threshold` the
    /// proposal merges into it: aliases union, canonical label decided by
    /// evidence count with lexicographic tie-break. Otherwise a new concept
    /// is created (deterministic id when a seed is given).
    pub fn upsert_concept(
        &self,
        label: &str,
        search_terms: &[String],
        embedding: &[f32],
        seed: Option<&ConceptSeed>,
        merge_threshold: f32,
    ) -> Result<UpsertOutcome> {
        let dimension = self.dimension();
        if embedding.len() != dimension {
            return Err(EngineError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            });
        }

        let nearest = {
            let index = self.concept_index_guard()?;
            index.search(embedding, 1)?.into_iter().next()
        };

        if let Some((existing_id, similarity)) = nearest {
            if similarity >= merge_threshold {
                self.merge_into_concept(&existing_id, label, search_terms)?;
                return Ok(UpsertOutcome {
                    concept_id: existing_id,
                    merged: true,
                    similarity: Some(similarity),
                });
            }
        }

        let concept_id = match seed {
            Some(seed) => concept_id_for(&seed.content_hash, seed.chunk_index),
            None => format!("c_{}", Uuid::new_v4().simple()),
        };

        // Re-ingesting identical content converges on the same id; treat the
        // existing row as the merge target instead of failing the insert.
        if self.get_concept(&concept_id)?.is_some() {
            self.merge_into_concept(&concept_id, label, search_terms)?;
            return Ok(UpsertOutcome {
                concept_id,
                merged: true,
                similarity: None,
            });
        }

        let now = Utc::now().to_rfc3339();
        let mut terms: Vec<String> = search_terms.to_vec();
        let label_lower = label.to_lowercase();
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(&label_lower)) {
            terms.push(label_lower);
        }
        let terms_json = serde_json::to_string(&terms)?;
        let model = self
            .active_embedding_config()?
            .map(|c| c.model_name)
            .unwrap_or_default();

        {
            let writer = self.writer_guard()?;
            writer.execute(
                "INSERT INTO concepts (concept_id, label, search_terms, evidence_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![concept_id, label, terms_json, now],
            )?;
            writer.execute(
                "INSERT INTO concept_embeddings (concept_id, embedding, dimension, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    concept_id,
                    Embedding::new(embedding.to_vec()).to_bytes(),
                    dimension as i64,
                    model,
                    now
                ],
            )?;
        }

        let mut index = self.concept_index_guard()?;
        index.add(&concept_id, embedding)?;

        Ok(UpsertOutcome {
            concept_id,
            merged: false,
            similarity: None,
        })
    }

    /// Fold a proposal's label and aliases into an existing concept
    fn merge_into_concept(
        &self,
        concept_id: &str,
        label: &str,
        search_terms: &[String],
    ) -> Result<()> {
        let existing = self
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {}", concept_id)))?;

        let mut terms: Vec<String> = existing.search_terms.clone();
        let mut push_unique = |candidate: String| {
            if !terms.iter().any(|t| t.eq_ignore_ascii_case(&candidate)) {
                terms.push(candidate);
            }
        };
        for term in search_terms {
            push_unique(term.clone());
        }
        push_unique(label.to_lowercase());

        // Canonical label: highest evidence count wins; the incoming
        // proposal carries none, so the stored label only changes on the
        // zero-evidence lexicographic tie-break.
        let canonical = if existing.evidence_count == 0 && label < existing.label.as_str() {
            label.to_string()
        } else {
            existing.label.clone()
        };

        let writer = self.writer_guard()?;
        writer.execute(
            "UPDATE concepts SET label = ?1, search_terms = ?2, updated_at = ?3 WHERE concept_id = ?4",
            params![
                canonical,
                serde_json::to_string(&terms)?,
                Utc::now().to_rfc3339(),
                concept_id
            ],
        )?;
        Ok(())
    }

    fn row_to_concept(row: &rusqlite::Row) -> rusqlite::Result<Concept> {
        let terms_json: String = row.get("search_terms")?;
        Ok(Concept {
            concept_id: row.get("concept_id")?,
            label: row.get("label")?,
            search_terms: serde_json::from_str(&terms_json).unwrap_or_default(),
            evidence_count: row.get("evidence_count")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
            updated_at: Self::parse_timestamp(&row.get::<_, String>("updated_at")?)?,
        })
    }

    /// Get a concept by id
    pub fn get_concept(&self, concept_id: &str) -> Result<Option<Concept>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM concepts WHERE concept_id = ?1")?;
        Ok(stmt
            .query_row(params![concept_id], Self::row_to_concept)
            .optional()?)
    }

    /// Stored embedding vector for a concept, regardless of dimension
    pub fn get_concept_embedding(&self, concept_id: &str) -> Result<Option<Vec<f32>>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT embedding FROM concept_embeddings WHERE concept_id = ?1")?;
        let bytes: Option<Vec<u8>> = stmt
            .query_row(params![concept_id], |row| row.get(0))
            .optional()?;
        Ok(bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector)))
    }

    /// Delete a concept and all dependent rows
    pub fn delete_concept(&self, concept_id: &str) -> Result<()> {
        let deleted = {
            let writer = self.writer_guard()?;
            writer.execute(
                "DELETE FROM concepts WHERE concept_id = ?1",
                params![concept_id],
            )?
        };
        if deleted == 0 {
            return Err(EngineError::NotFound(format!("concept {}", concept_id)));
        }
        let mut index = self.concept_index_guard()?;
        let _ = index.remove(concept_id)?;
        Ok(())
    }

    /// ANN over concept embeddings; empty result is success
    pub fn knn_concepts(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>> {
        let index = self.concept_index_guard()?;
        index.search_with_threshold(vector, k, min_similarity)
    }

    /// ANN over source-chunk embeddings; keys are (source, chunk, strategy)
    pub fn knn_source_chunks(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, i64, String, f32)>> {
        let index = self.chunk_index_guard()?;
        let hits = index.search_with_threshold(vector, k, min_similarity)?;
        Ok(hits
            .into_iter()
            .filter_map(|(key, score)| {
                parse_chunk_key(&key).map(|(s, i, st)| (s, i, st, score))
            })
            .collect())
    }

    /// Concepts lacking an embedding of the active dimension
    pub fn concepts_missing_embedding(&self, dimension: usize) -> Result<Vec<(String, String)>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT c.concept_id, c.label FROM concepts c
             LEFT JOIN concept_embeddings e ON e.concept_id = c.concept_id
             WHERE e.concept_id IS NULL OR e.dimension != ?1
             ORDER BY c.concept_id",
        )?;
        let rows = stmt
            .query_map(params![dimension as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Atomic per-concept embedding rewrite, safe with concurrent readers
    pub fn bulk_update_concept_embeddings(
        &self,
        batch: &[(String, Vec<f32>)],
        model: &str,
    ) -> Result<usize> {
        let dimension = self.dimension();
        let now = Utc::now().to_rfc3339();
        let mut updated = 0usize;

        for (concept_id, vector) in batch {
            if vector.len() != dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            {
                let writer = self.writer_guard()?;
                writer.execute(
                    "INSERT OR REPLACE INTO concept_embeddings
                     (concept_id, embedding, dimension, model, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        concept_id,
                        Embedding::new(vector.clone()).to_bytes(),
                        dimension as i64,
                        model,
                        now
                    ],
                )?;
            }
            let mut index = self.concept_index_guard()?;
            index.add(concept_id, vector)?;
            updated += 1;
        }
        Ok(updated)
    }

    /// List concepts, newest first
    pub fn list_concepts(&self, limit: i64, offset: i64) -> Result<Vec<Concept>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader
            .prepare("SELECT * FROM concepts ORDER BY created_at DESC LIMIT ?1 OFFSET ?2")?;
        let rows = stmt
            .query_map(params![limit, offset], Self::row_to_concept)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // ONTOLOGIES
    // ========================================================================

    fn row_to_ontology(row: &rusqlite::Row) -> rusqlite::Result<Ontology> {
        Ok(Ontology {
            name: row.get("name")?,
            description: row.get("description")?,
            anchor_concept_id: row.get("anchor_concept_id")?,
            epoch: row.get("epoch")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
            updated_at: Self::parse_timestamp(&row.get::<_, String>("updated_at")?)?,
        })
    }

    /// Get or create an ontology namespace
    pub fn ensure_ontology(&self, name: &str) -> Result<Ontology> {
        {
            let writer = self.writer_guard()?;
            writer.execute(
                "INSERT OR IGNORE INTO ontologies (name, epoch, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )?;
        }
        self.get_ontology(name)?
            .ok_or_else(|| EngineError::NotFound(format!("ontology {}", name)))
    }

    /// Get an ontology by name
    pub fn get_ontology(&self, name: &str) -> Result<Option<Ontology>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM ontologies WHERE name = ?1")?;
        Ok(stmt
            .query_row(params![name], Self::row_to_ontology)
            .optional()?)
    }

    /// List all ontologies
    pub fn list_ontologies(&self) -> Result<Vec<Ontology>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM ontologies ORDER BY name")?;
        let rows = stmt
            .query_map([], Self::row_to_ontology)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Advance an ontology's epoch counter; returns the new value
    pub fn bump_ontology_epoch(&self, name: &str) -> Result<i64> {
        let writer = self.writer_guard()?;
        writer.execute(
            "UPDATE ontologies SET epoch = epoch + 1, updated_at = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        let epoch = writer.query_row(
            "SELECT epoch FROM ontologies WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(epoch)
    }

    /// Set or clear the anchor concept of an ontology
    pub fn set_ontology_anchor(&self, name: &str, concept_id: Option<&str>) -> Result<()> {
        let writer = self.writer_guard()?;
        let changed = writer.execute(
            "UPDATE ontologies SET anchor_concept_id = ?1, updated_at = ?2 WHERE name = ?3",
            params![concept_id, Utc::now().to_rfc3339(), name],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("ontology {}", name)));
        }
        Ok(())
    }

    // ========================================================================
    // SOURCES
    // ========================================================================

    fn row_to_source(row: &rusqlite::Row) -> rusqlite::Result<Source> {
        Ok(Source {
            source_id: row.get("source_id")?,
            ontology: row.get("ontology")?,
            document: row.get("document")?,
            paragraph: row.get("paragraph")?,
            full_text: row.get("full_text")?,
            content_hash: row.get("content_hash")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
        })
    }

    /// Insert a source row; the ontology must already exist
    pub fn insert_source(&self, source: &Source) -> Result<()> {
        let writer = self.writer_guard()?;
        writer
            .execute(
                "INSERT INTO sources (source_id, ontology, document, paragraph, full_text, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    source.source_id,
                    source.ontology,
                    source.document,
                    source.paragraph,
                    source.full_text,
                    source.content_hash,
                    source.created_at.to_rfc3339()
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    EngineError::Conflict(format!("source {} already exists", source.source_id))
                }
                other => EngineError::Database(other),
            })?;
        Ok(())
    }

    /// Get a source by id
    pub fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM sources WHERE source_id = ?1")?;
        Ok(stmt
            .query_row(params![source_id], Self::row_to_source)
            .optional()?)
    }

    /// Find a source by content hash within an ontology (duplicate check)
    pub fn find_source_by_hash(&self, ontology: &str, content_hash: &str) -> Result<Option<Source>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT * FROM sources WHERE ontology = ?1 AND content_hash = ?2")?;
        Ok(stmt
            .query_row(params![ontology, content_hash], Self::row_to_source)
            .optional()?)
    }

    /// Populate `content_hash`; only ever set once
    pub fn set_source_content_hash(&self, source_id: &str, content_hash: &str) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute(
            "UPDATE sources SET content_hash = ?1 WHERE source_id = ?2 AND content_hash IS NULL",
            params![content_hash, source_id],
        )?;
        Ok(())
    }

    /// Source ids belonging to an ontology
    pub fn sources_for_ontology(&self, ontology: &str) -> Result<Vec<String>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT source_id FROM sources WHERE ontology = ?1 ORDER BY source_id")?;
        let rows = stmt
            .query_map(params![ontology], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All source ids
    pub fn all_source_ids(&self) -> Result<Vec<String>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT source_id FROM sources ORDER BY source_id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SOURCE CHUNKS
    // ========================================================================

    fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<SourceChunk> {
        let strategy: String = row.get("chunk_strategy")?;
        let bytes: Vec<u8> = row.get("embedding")?;
        Ok(SourceChunk {
            source_id: row.get("source_id")?,
            chunk_index: row.get("chunk_index")?,
            strategy: strategy.parse().unwrap_or_default(),
            start_offset: row.get("start_offset")?,
            end_offset: row.get("end_offset")?,
            chunk_text: row.get("chunk_text")?,
            chunk_hash: row.get("chunk_hash")?,
            source_hash: row.get("source_hash")?,
            embedding: Embedding::from_bytes(&bytes)
                .map(|e| e.vector)
                .unwrap_or_default(),
            model: row.get("model")?,
            dimension: row.get("dimension")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
        })
    }

    /// Insert an embedded chunk; false when the row already existed
    pub fn insert_source_chunk(&self, chunk: &SourceChunk) -> Result<bool> {
        let inserted = {
            let writer = self.writer_guard()?;
            writer.execute(
                "INSERT OR IGNORE INTO source_embeddings
                 (source_id, chunk_index, chunk_strategy, start_offset, end_offset, chunk_text,
                  chunk_hash, source_hash, embedding, model, dimension, quarantined, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
                params![
                    chunk.source_id,
                    chunk.chunk_index,
                    chunk.strategy.as_str(),
                    chunk.start_offset,
                    chunk.end_offset,
                    chunk.chunk_text,
                    chunk.chunk_hash,
                    chunk.source_hash,
                    Embedding::new(chunk.embedding.clone()).to_bytes(),
                    chunk.model,
                    chunk.dimension,
                    chunk.created_at.to_rfc3339()
                ],
            )? > 0
        };

        if inserted {
            let mut index = self.chunk_index_guard()?;
            let key = chunk_key(&chunk.source_id, chunk.chunk_index, chunk.strategy.as_str());
            index.add(&key, &chunk.embedding)?;
        }
        Ok(inserted)
    }

    /// Embedded chunks of a source under one strategy
    pub fn source_chunks(
        &self,
        source_id: &str,
        strategy: crate::graph::ChunkStrategy,
    ) -> Result<Vec<SourceChunk>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM source_embeddings
             WHERE source_id = ?1 AND chunk_strategy = ?2 AND quarantined = 0
             ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![source_id, strategy.as_str()], Self::row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// One chunk row, quarantined or not
    pub fn get_source_chunk(
        &self,
        source_id: &str,
        chunk_index: i64,
        strategy: crate::graph::ChunkStrategy,
    ) -> Result<Option<SourceChunk>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM source_embeddings
             WHERE source_id = ?1 AND chunk_index = ?2 AND chunk_strategy = ?3",
        )?;
        Ok(stmt
            .query_row(
                params![source_id, chunk_index, strategy.as_str()],
                Self::row_to_chunk,
            )
            .optional()?)
    }

    /// Drop all chunks of a source under one strategy (pre-regeneration)
    pub fn delete_source_chunks(
        &self,
        source_id: &str,
        strategy: crate::graph::ChunkStrategy,
    ) -> Result<usize> {
        let keys: Vec<String> = {
            let reader = self.reader_guard()?;
            let mut stmt = reader.prepare(
                "SELECT chunk_index FROM source_embeddings
                 WHERE source_id = ?1 AND chunk_strategy = ?2",
            )?;
            let indexes = stmt
                .query_map(params![source_id, strategy.as_str()], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            indexes
                .into_iter()
                .map(|i| chunk_key(source_id, i, strategy.as_str()))
                .collect()
        };

        let deleted = {
            let writer = self.writer_guard()?;
            writer.execute(
                "DELETE FROM source_embeddings WHERE source_id = ?1 AND chunk_strategy = ?2",
                params![source_id, strategy.as_str()],
            )?
        };

        let mut index = self.chunk_index_guard()?;
        for key in keys {
            let _ = index.remove(&key)?;
        }
        Ok(deleted)
    }

    /// Quarantine a chunk whose stored hash failed verification
    pub fn quarantine_source_chunk(
        &self,
        source_id: &str,
        chunk_index: i64,
        strategy: crate::graph::ChunkStrategy,
    ) -> Result<()> {
        {
            let writer = self.writer_guard()?;
            writer.execute(
                "UPDATE source_embeddings SET quarantined = 1
                 WHERE source_id = ?1 AND chunk_index = ?2 AND chunk_strategy = ?3",
                params![source_id, chunk_index, strategy.as_str()],
            )?;
        }
        let mut index = self.chunk_index_guard()?;
        let _ = index.remove(&chunk_key(source_id, chunk_index, strategy.as_str()))?;
        Ok(())
    }

    // ========================================================================
    // INSTANCES
    // ========================================================================

    /// Bind evidence from a concept to a source
    ///
    /// Identical (concept, source, quote) triples collapse onto the existing
    /// instance so repeated upserts never duplicate evidence.
    pub fn add_instance(
        &self,
        concept_id: &str,
        source_id: &str,
        quote: &str,
        paragraph: i64,
    ) -> Result<String> {
        let existing: Option<String> = {
            let reader = self.reader_guard()?;
            let mut stmt = reader.prepare(
                "SELECT instance_id FROM instances
                 WHERE concept_id = ?1 AND source_id = ?2 AND quote = ?3",
            )?;
            stmt.query_row(params![concept_id, source_id, quote], |row| row.get(0))
                .optional()?
        };
        if let Some(instance_id) = existing {
            return Ok(instance_id);
        }

        let instance_id = format!("i_{}", Uuid::new_v4().simple());
        let writer = self.writer_guard()?;
        let tx = writer.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO instances (instance_id, concept_id, source_id, quote, paragraph, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                instance_id,
                concept_id,
                source_id,
                quote,
                paragraph,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "UPDATE concepts SET evidence_count = evidence_count + 1, updated_at = ?1
             WHERE concept_id = ?2",
            params![Utc::now().to_rfc3339(), concept_id],
        )?;
        tx.commit()?;
        Ok(instance_id)
    }

    fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<Instance> {
        Ok(Instance {
            instance_id: row.get("instance_id")?,
            concept_id: row.get("concept_id")?,
            source_id: row.get("source_id")?,
            quote: row.get("quote")?,
            paragraph: row.get("paragraph")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
        })
    }

    /// Evidence instances for a concept
    pub fn instances_for_concept(&self, concept_id: &str) -> Result<Vec<Instance>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader
            .prepare("SELECT * FROM instances WHERE concept_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![concept_id], Self::row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Total instances across a set of sources
    pub fn count_instances_for_sources(&self, source_ids: &[String]) -> Result<i64> {
        let mut total = 0i64;
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT COUNT(*) FROM instances WHERE source_id = ?1")?;
        for source_id in source_ids {
            total += stmt.query_row(params![source_id], |row| row.get::<_, i64>(0))?;
        }
        Ok(total)
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// Add a typed edge between two concepts
    ///
    /// Validates the type against the active vocabulary and both endpoint
    /// embedding dimensions. Self-referencing edges are dropped silently.
    /// UPSERT semantics on (src, type, dst); returns false for dropped
    /// self-loops.
    pub fn add_edge(
        &self,
        src_concept_id: &str,
        rel_type: &str,
        dst_concept_id: &str,
        confidence: f32,
        provenance: Option<&str>,
    ) -> Result<bool> {
        if src_concept_id == dst_concept_id {
            tracing::debug!(concept = src_concept_id, rel_type, "dropping self-loop edge");
            return Ok(false);
        }

        let active: Option<bool> = {
            let reader = self.reader_guard()?;
            let mut stmt = reader.prepare("SELECT is_active FROM vocab_types WHERE name = ?1")?;
            stmt.query_row(params![rel_type], |row| row.get::<_, bool>(0))
                .optional()?
        };
        if !active.unwrap_or(false) {
            return Err(EngineError::UnknownVocabType(rel_type.to_string()));
        }

        let dimension = self.dimension();
        for concept_id in [src_concept_id, dst_concept_id] {
            if self.get_concept(concept_id)?.is_none() {
                return Err(EngineError::NotFound(format!("concept {}", concept_id)));
            }
            let actual = self
                .get_concept_embedding(concept_id)?
                .map(|v| v.len())
                .unwrap_or(0);
            if actual != dimension {
                return Err(EngineError::DimensionMismatch {
                    expected: dimension,
                    actual,
                });
            }
        }

        let writer = self.writer_guard()?;
        let tx = writer.unchecked_transaction()?;
        let existed: bool = tx
            .query_row(
                "SELECT 1 FROM edges WHERE src_concept_id = ?1 AND rel_type = ?2 AND dst_concept_id = ?3",
                params![src_concept_id, rel_type, dst_concept_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        tx.execute(
            "INSERT INTO edges (src_concept_id, rel_type, dst_concept_id, confidence, provenance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (src_concept_id, rel_type, dst_concept_id)
             DO UPDATE SET confidence = excluded.confidence",
            params![
                src_concept_id,
                rel_type,
                dst_concept_id,
                confidence.clamp(0.0, 1.0),
                provenance,
                Utc::now().to_rfc3339()
            ],
        )?;
        if !existed {
            tx.execute(
                "UPDATE vocab_types SET usage_count = usage_count + 1 WHERE name = ?1",
                params![rel_type],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
        Ok(Relationship {
            src_concept_id: row.get("src_concept_id")?,
            rel_type: row.get("rel_type")?,
            dst_concept_id: row.get("dst_concept_id")?,
            confidence: row.get("confidence")?,
            provenance: row.get("provenance")?,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
        })
    }

    /// Incoming edges of a concept
    pub fn incoming_edges(&self, concept_id: &str) -> Result<Vec<Relationship>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT * FROM edges WHERE dst_concept_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![concept_id], Self::row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All edges touching a concept, either direction
    pub fn edges_for_concept(&self, concept_id: &str) -> Result<Vec<Relationship>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM edges WHERE src_concept_id = ?1 OR dst_concept_id = ?1
             ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![concept_id], Self::row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Total degree (in + out) of a concept
    pub fn concept_degree(&self, concept_id: &str) -> Result<i64> {
        let reader = self.reader_guard()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM edges WHERE src_concept_id = ?1 OR dst_concept_id = ?1",
            params![concept_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sample up to `limit` edges of one type, newest first
    pub fn sample_edges_for_type(&self, rel_type: &str, limit: usize) -> Result<Vec<Relationship>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM edges WHERE rel_type = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![rel_type, limit as i64], Self::row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Edge count per type
    pub fn count_edges_for_type(&self, rel_type: &str) -> Result<i64> {
        let reader = self.reader_guard()?;
        let count = reader.query_row(
            "SELECT COUNT(*) FROM edges WHERE rel_type = ?1",
            params![rel_type],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Match edges under type/role/endpoint filters
    ///
    /// Role filters derive an allowed type-set from the registry first; the
    /// edge query then restricts to it. With no role filters the behavior is
    /// the plain type/endpoint match.
    pub fn match_concept_relationships(
        &self,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>> {
        let allowed_types: Option<HashSet<String>> = if filter.include_roles.is_some()
            || filter.exclude_roles.is_some()
        {
            let include: Option<HashSet<&SemanticRole>> =
                filter.include_roles.as_ref().map(|r| r.iter().collect());
            let exclude: Option<HashSet<&SemanticRole>> =
                filter.exclude_roles.as_ref().map(|r| r.iter().collect());
            let allowed = self
                .list_vocab_types(false)?
                .into_iter()
                .filter(|vt| {
                    if let Some(include) = &include {
                        if !include.contains(&vt.semantic_role) {
                            return false;
                        }
                    }
                    if let Some(exclude) = &exclude {
                        if exclude.contains(&vt.semantic_role) {
                            return false;
                        }
                    }
                    true
                })
                .map(|vt| vt.name)
                .collect();
            Some(allowed)
        } else {
            None
        };

        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let rows = {
            let reader = self.reader_guard()?;
            let mut stmt = reader.prepare(
                "SELECT * FROM edges
                 WHERE (?1 IS NULL OR src_concept_id = ?1)
                   AND (?2 IS NULL OR dst_concept_id = ?2)
                 ORDER BY created_at DESC",
            )?;
            stmt.query_map(
                params![filter.src_concept_id, filter.dst_concept_id],
                Self::row_to_relationship,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let requested: Option<HashSet<&String>> =
            filter.rel_types.as_ref().map(|t| t.iter().collect());

        Ok(rows
            .into_iter()
            .filter(|edge| {
                if let Some(requested) = &requested {
                    if !requested.contains(&edge.rel_type) {
                        return false;
                    }
                }
                if let Some(allowed) = &allowed_types {
                    if !allowed.contains(&edge.rel_type) {
                        return false;
                    }
                }
                true
            })
            .take(limit)
            .collect())
    }

    /// Move every edge of one type onto another (vocabulary merge)
    ///
    /// Existing (src, to_type, dst) rows absorb the duplicates; usage counts
    /// are recounted for both types afterwards.
    pub fn repoint_edges(&self, from_type: &str, to_type: &str) -> Result<usize> {
        let moved = {
            let writer = self.writer_guard()?;
            let tx = writer.unchecked_transaction()?;
            let moved: usize = tx.execute(
                "INSERT OR IGNORE INTO edges
                 (src_concept_id, rel_type, dst_concept_id, confidence, provenance, created_at)
                 SELECT src_concept_id, ?1, dst_concept_id, confidence, provenance, created_at
                 FROM edges WHERE rel_type = ?2",
                params![to_type, from_type],
            )?;
            tx.execute("DELETE FROM edges WHERE rel_type = ?1", params![from_type])?;
            tx.execute(
                "UPDATE vocab_types SET usage_count =
                   (SELECT COUNT(*) FROM edges WHERE rel_type = vocab_types.name)
                 WHERE name IN (?1, ?2)",
                params![from_type, to_type],
            )?;
            tx.commit()?;
            moved
        };
        Ok(moved)
    }

    // ========================================================================
    // SKIPPED RELATIONSHIPS
    // ========================================================================

    /// Record an extraction-proposed type with no active vocabulary entry
    pub fn record_skipped_relationship(&self, rel_type: &str, context: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let writer = self.writer_guard()?;
        writer.execute(
            "INSERT INTO skipped_relationships (rel_type, occurrences, last_context, first_seen, last_seen)
             VALUES (?1, 1, ?2, ?3, ?3)
             ON CONFLICT (rel_type) DO UPDATE SET
               occurrences = occurrences + 1,
               last_context = excluded.last_context,
               last_seen = excluded.last_seen",
            params![rel_type, context, now],
        )?;
        Ok(())
    }

    /// Skipped relationship types, most frequent first
    pub fn list_skipped_relationships(&self) -> Result<Vec<SkippedRelationship>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT * FROM skipped_relationships ORDER BY occurrences DESC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SkippedRelationship {
                    rel_type: row.get("rel_type")?,
                    occurrences: row.get("occurrences")?,
                    last_context: row.get("last_context")?,
                    first_seen: Self::parse_timestamp(&row.get::<_, String>("first_seen")?)?,
                    last_seen: Self::parse_timestamp(&row.get::<_, String>("last_seen")?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // VOCABULARY REGISTRY ROWS
    // ========================================================================

    fn row_to_vocab_type(row: &rusqlite::Row) -> rusqlite::Result<VocabType> {
        let category: String = row.get("category")?;
        let runner_up: Option<String> = row.get("runner_up_category")?;
        let role: String = row.get("semantic_role")?;
        let embedding_bytes: Option<Vec<u8>> = row.get("embedding")?;
        let grounding_avg: Option<f64> = row.get("grounding_avg")?;
        let grounding_stats = match grounding_avg {
            Some(avg) => Some(GroundingStats {
                avg,
                variance: row.get::<_, Option<f64>>("grounding_variance")?.unwrap_or(0.0),
                sample_size: row
                    .get::<_, Option<i64>>("grounding_samples")?
                    .unwrap_or(0) as usize,
                measured_at: Self::parse_timestamp(
                    &row.get::<_, Option<String>>("grounding_measured_at")?
                        .unwrap_or_default(),
                )?,
            }),
            None => None,
        };
        Ok(VocabType {
            name: row.get("name")?,
            description: row.get("description")?,
            category: category.parse().unwrap_or(Category::Semantic),
            category_confidence: row.get("category_confidence")?,
            ambiguous: row.get("ambiguous")?,
            runner_up_category: runner_up.and_then(|s| s.parse().ok()),
            is_builtin: row.get("is_builtin")?,
            is_active: row.get("is_active")?,
            usage_count: row.get("usage_count")?,
            embedding: embedding_bytes.and_then(|b| Embedding::from_bytes(&b).map(|e| e.vector)),
            embedding_dimension: row.get("embedding_dimension")?,
            embedding_model: row.get("embedding_model")?,
            semantic_role: role.parse().unwrap_or_default(),
            grounding_stats,
            created_at: Self::parse_timestamp(&row.get::<_, String>("created_at")?)?,
            updated_at: Self::parse_timestamp(&row.get::<_, String>("updated_at")?)?,
        })
    }

    /// Insert or fully replace a vocabulary type row
    pub fn upsert_vocab_type(&self, vocab_type: &VocabType) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute(
            "INSERT OR REPLACE INTO vocab_types
             (name, description, category, category_confidence, ambiguous, runner_up_category,
              is_builtin, is_active, usage_count, embedding, embedding_dimension, embedding_model,
              semantic_role, grounding_avg, grounding_variance, grounding_samples,
              grounding_measured_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                vocab_type.name,
                vocab_type.description,
                vocab_type.category.as_str(),
                vocab_type.category_confidence,
                vocab_type.ambiguous,
                vocab_type.runner_up_category.map(|c| c.as_str()),
                vocab_type.is_builtin,
                vocab_type.is_active,
                vocab_type.usage_count,
                vocab_type
                    .embedding
                    .as_ref()
                    .map(|v| Embedding::new(v.clone()).to_bytes()),
                vocab_type.embedding_dimension,
                vocab_type.embedding_model,
                vocab_type.semantic_role.as_str(),
                vocab_type.grounding_stats.map(|s| s.avg),
                vocab_type.grounding_stats.map(|s| s.variance),
                vocab_type.grounding_stats.map(|s| s.sample_size as i64),
                vocab_type.grounding_stats.map(|s| s.measured_at.to_rfc3339()),
                vocab_type.created_at.to_rfc3339(),
                vocab_type.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Get a vocabulary type by name
    pub fn get_vocab_type(&self, name: &str) -> Result<Option<VocabType>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT * FROM vocab_types WHERE name = ?1")?;
        Ok(stmt
            .query_row(params![name], Self::row_to_vocab_type)
            .optional()?)
    }

    /// List vocabulary types
    pub fn list_vocab_types(&self, active_only: bool) -> Result<Vec<VocabType>> {
        let reader = self.reader_guard()?;
        let sql = if active_only {
            "SELECT * FROM vocab_types WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT * FROM vocab_types ORDER BY name"
        };
        let mut stmt = reader.prepare(sql)?;
        let rows = stmt
            .query_map([], Self::row_to_vocab_type)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Store a vocabulary type embedding
    pub fn set_vocab_embedding(&self, name: &str, vector: &[f32], model: &str) -> Result<()> {
        let writer = self.writer_guard()?;
        let changed = writer.execute(
            "UPDATE vocab_types SET embedding = ?1, embedding_dimension = ?2,
             embedding_model = ?3, updated_at = ?4 WHERE name = ?5",
            params![
                Embedding::new(vector.to_vec()).to_bytes(),
                vector.len() as i64,
                model,
                Utc::now().to_rfc3339(),
                name
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownVocabType(name.to_string()));
        }
        Ok(())
    }

    /// Store category classification results
    pub fn set_vocab_classification(
        &self,
        name: &str,
        category: Category,
        confidence: f64,
        ambiguous: bool,
        runner_up: Option<Category>,
    ) -> Result<()> {
        let writer = self.writer_guard()?;
        let changed = writer.execute(
            "UPDATE vocab_types SET category = ?1, category_confidence = ?2, ambiguous = ?3,
             runner_up_category = ?4, updated_at = ?5 WHERE name = ?6",
            params![
                category.as_str(),
                confidence,
                ambiguous,
                runner_up.map(|c| c.as_str()),
                Utc::now().to_rfc3339(),
                name
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownVocabType(name.to_string()));
        }
        Ok(())
    }

    /// Store semantic-role measurement results
    pub fn set_vocab_role(
        &self,
        name: &str,
        role: SemanticRole,
        stats: Option<GroundingStats>,
    ) -> Result<()> {
        let writer = self.writer_guard()?;
        let changed = writer.execute(
            "UPDATE vocab_types SET semantic_role = ?1, grounding_avg = ?2,
             grounding_variance = ?3, grounding_samples = ?4, grounding_measured_at = ?5,
             updated_at = ?6 WHERE name = ?7",
            params![
                role.as_str(),
                stats.map(|s| s.avg),
                stats.map(|s| s.variance),
                stats.map(|s| s.sample_size as i64),
                stats.map(|s| s.measured_at.to_rfc3339()),
                Utc::now().to_rfc3339(),
                name
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownVocabType(name.to_string()));
        }
        Ok(())
    }

    /// Activate or deactivate a vocabulary type
    pub fn set_vocab_active(&self, name: &str, is_active: bool) -> Result<()> {
        let writer = self.writer_guard()?;
        let changed = writer.execute(
            "UPDATE vocab_types SET is_active = ?1, updated_at = ?2 WHERE name = ?3",
            params![is_active, Utc::now().to_rfc3339(), name],
        )?;
        if changed == 0 {
            return Err(EngineError::UnknownVocabType(name.to_string()));
        }
        Ok(())
    }

    /// Delete a vocabulary type row outright (post-merge pruning)
    pub fn delete_vocab_type(&self, name: &str) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute("DELETE FROM vocab_types WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Ratio of inactive types over all registered types
    pub fn inactive_vocab_ratio(&self) -> Result<f64> {
        let reader = self.reader_guard()?;
        let (total, inactive): (i64, i64) = reader.query_row(
            "SELECT COUNT(*), SUM(CASE WHEN is_active = 0 THEN 1 ELSE 0 END) FROM vocab_types",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                ))
            },
        )?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(inactive as f64 / total as f64)
    }

    // ========================================================================
    // PROVIDER CONFIGURATION
    // ========================================================================

    /// The single active embedding configuration, if any
    pub fn active_embedding_config(&self) -> Result<Option<EmbeddingConfig>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT provider, model_name, dimension, precision FROM embedding_config
             WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
        )?;
        let config = stmt
            .query_row([], |row| {
                let precision: String = row.get(3)?;
                Ok(EmbeddingConfig {
                    provider: row.get(0)?,
                    model_name: row.get(1)?,
                    dimension: row.get::<_, i64>(2)? as usize,
                    precision: precision.parse().unwrap_or(Precision::Float32),
                })
            })
            .optional()?;
        Ok(config)
    }

    /// Atomically make `config` the single active embedding configuration
    pub fn activate_embedding_config(&self, config: &EmbeddingConfig) -> Result<()> {
        let writer = self.writer_guard()?;
        let tx = writer.unchecked_transaction()?;
        tx.execute("UPDATE embedding_config SET is_active = 0", [])?;
        tx.execute(
            "INSERT INTO embedding_config (provider, model_name, dimension, precision, is_active, activated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                config.provider,
                config.model_name,
                config.dimension as i64,
                config.precision.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The single active reasoning configuration, if any
    pub fn active_ai_config(&self) -> Result<Option<crate::config::AiProviderConfig>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT provider, model_name, capabilities FROM ai_provider_config
             WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
        )?;
        let config = stmt
            .query_row([], |row| {
                let caps_json: String = row.get(2)?;
                Ok(crate::config::AiProviderConfig {
                    provider: row.get(0)?,
                    model_name: row.get(1)?,
                    capabilities: serde_json::from_str(&caps_json).unwrap_or_default(),
                })
            })
            .optional()?;
        Ok(config)
    }

    /// Atomically make `config` the single active reasoning configuration
    pub fn activate_ai_config(&self, config: &crate::config::AiProviderConfig) -> Result<()> {
        let writer = self.writer_guard()?;
        let tx = writer.unchecked_transaction()?;
        tx.execute("UPDATE ai_provider_config SET is_active = 0", [])?;
        tx.execute(
            "INSERT INTO ai_provider_config (provider, model_name, capabilities, is_active, activated_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![
                config.provider,
                config.model_name,
                serde_json::to_string(&config.capabilities)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // ENCRYPTED KEYS
    // ========================================================================

    /// Store ciphertext for a provider key
    pub fn put_encrypted_key(&self, provider: &str, nonce: &[u8], ciphertext: &[u8]) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute(
            "INSERT INTO encrypted_keys (provider, nonce, ciphertext, validation_status, updated_at)
             VALUES (?1, ?2, ?3, 'untested', ?4)
             ON CONFLICT (provider) DO UPDATE SET
               nonce = excluded.nonce,
               ciphertext = excluded.ciphertext,
               validation_status = 'untested',
               validation_error = NULL,
               updated_at = excluded.updated_at",
            params![provider, nonce, ciphertext, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Ciphertext for a provider key
    pub fn get_encrypted_key(&self, provider: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reader = self.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT nonce, ciphertext FROM encrypted_keys WHERE provider = ?1")?;
        Ok(stmt
            .query_row(params![provider], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?)
    }

    /// Record the outcome of a key validation attempt
    pub fn set_key_validation(
        &self,
        provider: &str,
        status: KeyValidationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute(
            "UPDATE encrypted_keys SET validation_status = ?1, last_validated_at = ?2,
             validation_error = ?3, updated_at = ?2 WHERE provider = ?4",
            params![status.as_str(), Utc::now().to_rfc3339(), error, provider],
        )?;
        Ok(())
    }

    /// Key metadata for every stored provider; never the key material
    pub fn list_key_records(&self) -> Result<Vec<KeyRecord>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT provider, validation_status, last_validated_at, validation_error
             FROM encrypted_keys ORDER BY provider",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(1)?;
                let validated: Option<String> = row.get(2)?;
                Ok(KeyRecord {
                    provider: row.get(0)?,
                    validation_status: status.parse().unwrap_or_default(),
                    last_validated_at: validated
                        .map(|v| Self::parse_timestamp(&v))
                        .transpose()?,
                    validation_error: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // SYSTEM META
    // ========================================================================

    /// Read a meta value
    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader_guard()?;
        let mut stmt = reader.prepare("SELECT value FROM system_meta WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    /// Write a meta value
    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.writer_guard()?;
        writer.execute(
            "INSERT INTO system_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a meta counter, defaulting to zero
    pub fn meta_i64(&self, key: &str) -> Result<i64> {
        Ok(self
            .meta_get(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Atomically add to a meta counter; returns the new value
    pub fn meta_incr(&self, key: &str, delta: i64) -> Result<i64> {
        let writer = self.writer_guard()?;
        writer.execute(
            "INSERT INTO system_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + ?2 AS TEXT)",
            params![key, delta],
        )?;
        let value: String = writer.query_row(
            "SELECT value FROM system_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value.parse().unwrap_or(0))
    }

    // ========================================================================
    // HOT VIEWS
    // ========================================================================

    /// Recompute the denormalized hot-concept and hot-edge caches
    pub fn refresh_hot_views(&self, limit: usize) -> Result<(usize, usize)> {
        let now = Utc::now().to_rfc3339();
        let writer = self.writer_guard()?;
        let tx = writer.unchecked_transaction()?;

        tx.execute("DELETE FROM hot_concepts", [])?;
        let concepts = tx.execute(
            "INSERT INTO hot_concepts (concept_id, score, refreshed_at)
             SELECT c.concept_id,
                    c.evidence_count + (SELECT COUNT(*) FROM edges e
                                        WHERE e.src_concept_id = c.concept_id
                                           OR e.dst_concept_id = c.concept_id) AS score,
                    ?1
             FROM concepts c
             ORDER BY score DESC
             LIMIT ?2",
            params![now, limit as i64],
        )?;

        tx.execute("DELETE FROM hot_edges", [])?;
        let edges = tx.execute(
            "INSERT INTO hot_edges (src_concept_id, rel_type, dst_concept_id, score, refreshed_at)
             SELECT e.src_concept_id, e.rel_type, e.dst_concept_id,
                    e.confidence * (s.evidence_count + d.evidence_count + 1) AS score,
                    ?1
             FROM edges e
             JOIN concepts s ON s.concept_id = e.src_concept_id
             JOIN concepts d ON d.concept_id = e.dst_concept_id
             ORDER BY score DESC
             LIMIT ?2",
            params![now, limit as i64],
        )?;

        tx.commit()?;
        Ok((concepts, edges))
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Count snapshot across the whole store
    pub fn engine_stats(&self) -> Result<EngineStats> {
        let dimension = self.dimension() as i64;
        let reader = self.reader_guard()?;
        let count = |sql: &str| -> Result<i64> {
            Ok(reader.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(EngineStats {
            concepts: count("SELECT COUNT(*) FROM concepts")?,
            concepts_with_embedding: reader.query_row(
                "SELECT COUNT(*) FROM concept_embeddings WHERE dimension = ?1",
                params![dimension],
                |row| row.get(0),
            )?,
            sources: count("SELECT COUNT(*) FROM sources")?,
            source_chunks: count("SELECT COUNT(*) FROM source_embeddings WHERE quarantined = 0")?,
            instances: count("SELECT COUNT(*) FROM instances")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            vocab_types_active: count("SELECT COUNT(*) FROM vocab_types WHERE is_active = 1")?,
            vocab_types_total: count("SELECT COUNT(*) FROM vocab_types")?,
            ontologies: count("SELECT COUNT(*) FROM ontologies")?,
        })
    }
}

/// Chunk-index key for a (source, chunk, strategy) triple
fn chunk_key(source_id: &str, chunk_index: i64, strategy: &str) -> String {
    format!("{}:{}:{}", source_id, chunk_index, strategy)
}

/// Parse a chunk-index key back into its triple
fn parse_chunk_key(key: &str) -> Option<(String, i64, String)> {
    let mut parts = key.rsplitn(3, ':');
    let strategy = parts.next()?.to_string();
    let chunk_index: i64 = parts.next()?.parse().ok()?;
    let source_id = parts.next()?.to_string();
    Some((source_id, chunk_index, strategy))
}

// ============================================================================
// TESTS
// ============================================================================
