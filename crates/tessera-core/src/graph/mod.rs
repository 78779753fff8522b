//! Graph Entities
//!
//! The property-graph data model: concepts, sources, evidence instances,
//! typed relationships and ontologies. These are plain data carriers; all
//! persistence lives in [`crate::storage`].

mod types;

pub use types::{
    ChunkStrategy, Concept, ConceptSeed, Instance, Ontology, Relationship, SkippedRelationship,
    Source, SourceChunk, UpsertOutcome,
};

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of arbitrary text
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic concept id derived from the originating chunk
///
/// Ids must be reproducible across re-ingestion of identical content so that
/// retries and duplicate submissions converge on the same vertex.
pub fn concept_id_for(content_hash: &str, chunk_index: usize) -> String {
    let digest = sha256_hex(&format!("{content_hash}:{chunk_index}"));
    format!("c_{}", &digest[..24])
}

/// Deterministic source id for an ingestion chunk
pub fn source_id_for(content_hash: &str, chunk_index: usize) -> String {
    let digest = sha256_hex(&format!("{content_hash}:{chunk_index}:source"));
    format!("s_{}", &digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_deterministic_ids() {
        let a = concept_id_for("deadbeef", 3);
        let b = concept_id_for("deadbeef", 3);
        assert_eq!(a, b);
        assert!(a.starts_with("c_"));
        assert_ne!(a, concept_id_for("deadbeef", 4));
        assert_ne!(concept_id_for("deadbeef", 3), source_id_for("deadbeef", 3));
    }
}
