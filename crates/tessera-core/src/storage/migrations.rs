//! Database Migrations
//!
//! Schema migration definitions for the relational layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial graph schema: concepts, sources, instances, edges, vocabulary, configs",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Durable job queue, scheduled tasks, advisory locks",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Annealing proposals, hot views, skipped relationship capture",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: graph entities, vocabulary registry, provider configuration
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS concepts (
    concept_id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    search_terms TEXT NOT NULL DEFAULT '[]',
    evidence_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_concepts_label ON concepts(label);

-- Embeddings in a separate table so regeneration can swap them atomically
CREATE TABLE IF NOT EXISTS concept_embeddings (
    concept_id TEXT PRIMARY KEY REFERENCES concepts(concept_id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ontologies (
    name TEXT PRIMARY KEY,
    description TEXT,
    anchor_concept_id TEXT REFERENCES concepts(concept_id) ON DELETE SET NULL,
    epoch INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
    source_id TEXT PRIMARY KEY,
    ontology TEXT NOT NULL REFERENCES ontologies(name) ON DELETE CASCADE,
    document TEXT NOT NULL,
    paragraph INTEGER NOT NULL DEFAULT 0,
    full_text TEXT NOT NULL,
    content_hash TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_ontology ON sources(ontology);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sources_ontology_hash
    ON sources(ontology, content_hash) WHERE content_hash IS NOT NULL;

-- 1..N embedded chunks per source; quarantined rows are excluded from search
CREATE TABLE IF NOT EXISTS source_embeddings (
    source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    chunk_strategy TEXT NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    chunk_text TEXT NOT NULL,
    chunk_hash TEXT NOT NULL,
    source_hash TEXT NOT NULL,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    quarantined INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, chunk_index, chunk_strategy)
);

CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    concept_id TEXT NOT NULL REFERENCES concepts(concept_id) ON DELETE CASCADE,
    source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
    quote TEXT NOT NULL,
    paragraph INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_instances_concept ON instances(concept_id);
CREATE INDEX IF NOT EXISTS idx_instances_source ON instances(source_id);

-- Directed typed edges; the primary key gives UPSERT idempotence
CREATE TABLE IF NOT EXISTS edges (
    src_concept_id TEXT NOT NULL REFERENCES concepts(concept_id) ON DELETE CASCADE,
    rel_type TEXT NOT NULL,
    dst_concept_id TEXT NOT NULL REFERENCES concepts(concept_id) ON DELETE CASCADE,
    confidence REAL NOT NULL DEFAULT 1.0,
    provenance TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (src_concept_id, rel_type, dst_concept_id)
);

CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_concept_id);
CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(rel_type);

CREATE TABLE IF NOT EXISTS vocab_types (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT 'semantic',
    category_confidence REAL NOT NULL DEFAULT 0.0,
    ambiguous INTEGER NOT NULL DEFAULT 0,
    runner_up_category TEXT,
    is_builtin INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    usage_count INTEGER NOT NULL DEFAULT 0,
    embedding BLOB,
    embedding_dimension INTEGER,
    embedding_model TEXT,
    semantic_role TEXT NOT NULL DEFAULT 'UNCLASSIFIED',
    grounding_avg REAL,
    grounding_variance REAL,
    grounding_samples INTEGER,
    grounding_measured_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vocab_active ON vocab_types(is_active);

-- Exactly one active row at a time, enforced by the swap transaction
CREATE TABLE IF NOT EXISTS embedding_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    model_name TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    precision TEXT NOT NULL DEFAULT 'float32',
    is_active INTEGER NOT NULL DEFAULT 0,
    activated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ai_provider_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    model_name TEXT NOT NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 0,
    activated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS encrypted_keys (
    provider TEXT PRIMARY KEY,
    nonce BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    validation_status TEXT NOT NULL DEFAULT 'untested',
    last_validated_at TEXT,
    validation_error TEXT,
    updated_at TEXT NOT NULL
);

-- Engine counters: ingest_epoch, vocab_change_counter, checkpoints
CREATE TABLE IF NOT EXISTS system_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: durable job queue and scheduler
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    job_source TEXT NOT NULL DEFAULT 'user',
    is_system_job INTEGER NOT NULL DEFAULT 0,
    job_data TEXT NOT NULL DEFAULT '{}',
    analysis TEXT,
    progress TEXT,
    error_code TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    approved_by TEXT,
    claimed_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

-- Append-only progress stream; jobs.progress caches the latest snapshot
CREATE TABLE IF NOT EXISTS job_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    stage TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    fraction REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id, seq);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    name TEXT PRIMARY KEY,
    cron_expression TEXT NOT NULL,
    launcher TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run TEXT,
    last_success TEXT,
    next_run TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Lease rows giving at-most-one scheduler leader per key
CREATE TABLE IF NOT EXISTS advisory_locks (
    lock_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: annealing, hot views, skipped relationships
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS annealing_proposals (
    proposal_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    ontology TEXT,
    scores TEXT NOT NULL DEFAULT '{}',
    rationale TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    reviewer TEXT,
    created_at TEXT NOT NULL,
    decided_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_proposals_status ON annealing_proposals(status);

-- Denormalized caches of most-accessed concepts / most-traversed edges
CREATE TABLE IF NOT EXISTS hot_concepts (
    concept_id TEXT PRIMARY KEY REFERENCES concepts(concept_id) ON DELETE CASCADE,
    score REAL NOT NULL,
    refreshed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hot_edges (
    src_concept_id TEXT NOT NULL,
    rel_type TEXT NOT NULL,
    dst_concept_id TEXT NOT NULL,
    score REAL NOT NULL,
    refreshed_at TEXT NOT NULL,
    PRIMARY KEY (src_concept_id, rel_type, dst_concept_id)
);

-- Append-only capture of extraction-proposed unknown relationship types
CREATE TABLE IF NOT EXISTS skipped_relationships (
    rel_type TEXT PRIMARY KEY,
    occurrences INTEGER NOT NULL DEFAULT 0,
    last_context TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly_and_are_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(
            get_current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );

        // Re-applying is a no-op
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
