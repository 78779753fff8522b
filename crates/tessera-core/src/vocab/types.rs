//! Vocabulary type registry data model
//!
//! Every relationship type carries its own embedding plus probabilistic
//! category metadata and a measured semantic role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORY
// ============================================================================

/// Semantic category of a relationship type
///
/// Categories contain opposing poles (ENABLES and PREVENTS are both
/// causation), so category scoring uses max seed similarity, never the mean.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Causation,
    Composition,
    Logical,
    Evidential,
    Semantic,
    Temporal,
    Dependency,
    Derivation,
}

impl Category {
    /// All categories in declaration order
    pub const ALL: [Category; 8] = [
        Category::Causation,
        Category::Composition,
        Category::Logical,
        Category::Evidential,
        Category::Semantic,
        Category::Temporal,
        Category::Dependency,
        Category::Derivation,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Causation => "causation",
            Category::Composition => "composition",
            Category::Logical => "logical",
            Category::Evidential => "evidential",
            Category::Semantic => "semantic",
            Category::Temporal => "temporal",
            Category::Dependency => "dependency",
            Category::Derivation => "derivation",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "causation" => Ok(Category::Causation),
            "composition" => Ok(Category::Composition),
            "logical" => Ok(Category::Logical),
            "evidential" => Ok(Category::Evidential),
            "semantic" => Ok(Category::Semantic),
            "temporal" => Ok(Category::Temporal),
            "dependency" => Ok(Category::Dependency),
            "derivation" => Ok(Category::Derivation),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

// ============================================================================
// SEMANTIC ROLE
// ============================================================================

/// Measured semantic role of a relationship type
///
/// Derived from the grounding its edges contribute along the default
/// polarity axis, not from the type name (HISTORICAL excepted).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SemanticRole {
    /// Edges of this type push grounding strongly positive (mean > 0.8)
    Affirmative,
    /// Mixed evidential pressure (mean in [0.2, 0.8])
    Contested,
    /// Edges push grounding strongly negative (mean < -0.5)
    Contradictory,
    /// Name matches the temporal lexicon; ordering, not evidence
    Historical,
    /// Not yet measured, or measurement inconclusive
    #[default]
    Unclassified,
    /// Fewer than the minimum sampled edges
    InsufficientData,
}

impl SemanticRole {
    /// Convert to the stored string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticRole::Affirmative => "AFFIRMATIVE",
            SemanticRole::Contested => "CONTESTED",
            SemanticRole::Contradictory => "CONTRADICTORY",
            SemanticRole::Historical => "HISTORICAL",
            SemanticRole::Unclassified => "UNCLASSIFIED",
            SemanticRole::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

impl std::fmt::Display for SemanticRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SemanticRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AFFIRMATIVE" => Ok(SemanticRole::Affirmative),
            "CONTESTED" => Ok(SemanticRole::Contested),
            "CONTRADICTORY" => Ok(SemanticRole::Contradictory),
            "HISTORICAL" => Ok(SemanticRole::Historical),
            "UNCLASSIFIED" => Ok(SemanticRole::Unclassified),
            "INSUFFICIENT_DATA" => Ok(SemanticRole::InsufficientData),
            _ => Err(format!("Unknown semantic role: {}", s)),
        }
    }
}

// ============================================================================
// GROUNDING STATS
// ============================================================================

/// Aggregate grounding measurement for a vocabulary type
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingStats {
    /// Confidence-weighted mean projection of sampled edges
    pub avg: f64,
    /// Unweighted variance of the sampled projections
    pub variance: f64,
    /// Number of edges sampled
    pub sample_size: usize,
    /// When the measurement ran
    pub measured_at: DateTime<Utc>,
}

// ============================================================================
// VOCAB TYPE
// ============================================================================

/// A registered relationship type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VocabType {
    /// Uppercase identifier, e.g. SUPPORTS
    pub name: String,
    pub description: String,
    pub category: Category,
    /// Max seed similarity backing the category assignment, in [0, 1]
    pub category_confidence: f64,
    /// True when the runner-up category scored above the ambiguity threshold
    pub ambiguous: bool,
    pub runner_up_category: Option<Category>,
    pub is_builtin: bool,
    pub is_active: bool,
    /// Number of edges currently labeled with this type
    pub usage_count: i64,
    /// Mandatory for active types; None only before cold-start init
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    pub embedding_dimension: Option<i64>,
    pub embedding_model: Option<String>,
    pub semantic_role: SemanticRole,
    pub grounding_stats: Option<GroundingStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VocabType {
    /// Whether this type has an embedding of the given dimension
    pub fn has_embedding_of_dimension(&self, dimension: usize) -> bool {
        self.embedding
            .as_ref()
            .map(|e| e.len() == dimension)
            .unwrap_or(false)
    }
}
