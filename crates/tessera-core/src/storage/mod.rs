//! Storage Layer
//!
//! SQLite persistence for the property graph, the vocabulary registry, the
//! job queue and configuration, with integrated HNSW indexes over the
//! concept and source-chunk embedding namespaces.

pub mod migrations;
mod sqlite;

pub use sqlite::{EngineStats, GraphStore};

use serde::{Deserialize, Serialize};

use crate::vocab::SemanticRole;

/// Filter for relationship queries
///
/// Role filters are resolved against the vocabulary registry into an
/// allowed type-set before the edge query runs; with no role filters the
/// query behaves exactly as a plain type/endpoint match.
#[derive(Debug, Clone, Default)]
pub struct RelationshipFilter {
    /// Restrict to these relationship types
    pub rel_types: Option<Vec<String>>,
    /// Keep only types whose measured role is in this set
    pub include_roles: Option<Vec<SemanticRole>>,
    /// Drop types whose measured role is in this set
    pub exclude_roles: Option<Vec<SemanticRole>>,
    /// Restrict to edges leaving this concept
    pub src_concept_id: Option<String>,
    /// Restrict to edges arriving at this concept
    pub dst_concept_id: Option<String>,
    /// Maximum edges returned
    pub limit: usize,
}

impl RelationshipFilter {
    /// Filter for all edges arriving at a concept
    pub fn incoming(concept_id: &str) -> Self {
        Self {
            dst_concept_id: Some(concept_id.to_string()),
            limit: 1000,
            ..Default::default()
        }
    }
}

/// Validation state of a stored provider key
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyValidationStatus {
    Valid,
    Invalid,
    #[default]
    Untested,
}

impl KeyValidationStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyValidationStatus::Valid => "valid",
            KeyValidationStatus::Invalid => "invalid",
            KeyValidationStatus::Untested => "untested",
        }
    }
}

impl std::str::FromStr for KeyValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "valid" => Ok(KeyValidationStatus::Valid),
            "invalid" => Ok(KeyValidationStatus::Invalid),
            "untested" => Ok(KeyValidationStatus::Untested),
            _ => Err(format!("Unknown validation status: {}", s)),
        }
    }
}

/// Metadata about one stored provider key; never the key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub provider: String,
    pub validation_status: KeyValidationStatus,
    pub last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub validation_error: Option<String>,
}
