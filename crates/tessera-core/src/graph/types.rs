//! Core entity types for the property graph
//!
//! - Concepts are global, dedup-merged by embedding similarity
//! - Sources are ontology-local ingestion chunks
//! - Instances bind a concept to a source with a supporting quote
//! - Relationships are directed typed edges labeled by a vocabulary type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CHUNK STRATEGY
// ============================================================================

/// Strategy used to split a source's full text for embedding
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Sentence-bounded chunks, at most 500 characters each
    Sentence,
    /// One chunk covering the whole source text
    #[default]
    Paragraph,
    /// Chunks of at most 1000 characters cut at semantic boundaries
    Semantic,
}

impl ChunkStrategy {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            _ => Err(format!("Unknown chunk strategy: {}", s)),
        }
    }
}

// ============================================================================
// CONCEPT
// ============================================================================

/// A dedup-merged node representing an idea extracted from text
///
/// The embedding lives in a separate table keyed by `concept_id`; a concept
/// without one is excluded from similarity math until regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    /// Opaque deterministic identifier
    pub concept_id: String,
    /// Short canonical name
    pub label: String,
    /// Alias strings accumulated through merges
    pub search_terms: Vec<String>,
    /// Number of evidence instances bound to this concept
    pub evidence_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provenance seed for deterministic concept ids
///
/// Carried by ingestion so that re-processing identical content converges on
/// the same vertex id instead of minting a fresh UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptSeed {
    /// SHA-256 of the originating chunk text
    pub content_hash: String,
    /// Index of the chunk within its document
    pub chunk_index: usize,
}

/// Outcome of a concept upsert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    /// Id of the created or matched concept
    pub concept_id: String,
    /// True when an existing concept absorbed the proposal
    pub merged: bool,
    /// Similarity to the matched concept, when merged
    pub similarity: Option<f32>,
}

// ============================================================================
// SOURCE
// ============================================================================

/// An ingested chunk of a document, owned by an ontology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Unique id, one per ingested chunk
    pub source_id: String,
    /// Owning ontology namespace
    pub ontology: String,
    /// Document name or path the chunk came from
    pub document: String,
    /// Paragraph / chunk ordinal within the document
    pub paragraph: i64,
    /// Full chunk text, roughly 500-1500 words
    pub full_text: String,
    /// SHA-256 of `full_text`; populated on first embedding pass
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One embedded chunk of a source's full text
///
/// `source_hash` pins the chunk to the source text it was cut from; a
/// mismatch with the current text marks the row stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChunk {
    pub source_id: String,
    pub chunk_index: i64,
    pub strategy: ChunkStrategy,
    pub start_offset: i64,
    pub end_offset: i64,
    pub chunk_text: String,
    /// SHA-256 of `chunk_text`
    pub chunk_hash: String,
    /// SHA-256 of the source's full text at generation time
    pub source_hash: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub model: String,
    pub dimension: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// INSTANCE
// ============================================================================

/// Evidence record binding a concept to a source with a quote
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    pub concept_id: String,
    pub source_id: String,
    /// Verbatim supporting quote from the source
    pub quote: String,
    pub paragraph: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// RELATIONSHIP
// ============================================================================

/// A directed typed edge between two concepts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub src_concept_id: String,
    /// Uppercase vocabulary type name, e.g. SUPPORTS
    pub rel_type: String,
    pub dst_concept_id: String,
    /// Extraction confidence in [0, 1]
    pub confidence: f32,
    /// Optional provenance marker (source id or job id)
    pub provenance: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ONTOLOGY
// ============================================================================

/// A named namespace owning a set of sources
///
/// Concepts stay global and may hold evidence in many ontologies. The epoch
/// counter advances on every completed ingestion into the namespace and
/// drives annealing triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ontology {
    pub name: String,
    pub description: Option<String>,
    /// Concept promoted to anchor this ontology, if any
    pub anchor_concept_id: Option<String>,
    pub epoch: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// SKIPPED RELATIONSHIPS
// ============================================================================

/// An extraction-proposed relationship type with no active vocabulary entry
///
/// Captured append-only for curators; the edge itself is never written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRelationship {
    pub rel_type: String,
    pub occurrences: i64,
    /// Most recent extraction context mentioning the type
    pub last_context: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_chunk_strategy_round_trip() {
        for s in [
            ChunkStrategy::Sentence,
            ChunkStrategy::Paragraph,
            ChunkStrategy::Semantic,
        ] {
            assert_eq!(ChunkStrategy::from_str(s.as_str()).unwrap(), s);
        }
        assert!(ChunkStrategy::from_str("token").is_err());
    }

    #[test]
    fn test_concept_serde_camel_case() {
        let concept = Concept {
            concept_id: "c_1".into(),
            label: "Recursion".into(),
            search_terms: vec!["recursive".into()],
            evidence_count: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&concept).unwrap();
        assert!(json.contains("conceptId"));
        assert!(json.contains("searchTerms"));
    }
}
