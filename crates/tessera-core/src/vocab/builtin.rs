//! Builtin Vocabulary
//!
//! The 30 seed relationship types shipped with the engine, spanning all
//! eight categories. Category classification scores every type against
//! these seeds, and the default polarity pairs live entirely inside the
//! evidential and causation groups.

use chrono::Utc;

use crate::error::Result;
use crate::storage::GraphStore;
use crate::vocab::{Category, SemanticRole, VocabType};

/// A builtin seed type definition
#[derive(Debug, Clone, Copy)]
pub struct BuiltinType {
    pub name: &'static str,
    pub description: &'static str,
    pub category: Category,
}

/// The 30 builtin seed types
pub const BUILTIN_TYPES: &[BuiltinType] = &[
    // Causation
    BuiltinType {
        name: "CAUSES",
        description: "The source concept directly causes the target",
        category: Category::Causation,
    },
    BuiltinType {
        name: "ENABLES",
        description: "The source concept makes the target possible",
        category: Category::Causation,
    },
    BuiltinType {
        name: "PREVENTS",
        description: "The source concept stops the target from occurring",
        category: Category::Causation,
    },
    BuiltinType {
        name: "INFLUENCES",
        description: "The source concept affects the target without determining it",
        category: Category::Causation,
    },
    // Composition
    BuiltinType {
        name: "PART_OF",
        description: "The source concept is a component of the target",
        category: Category::Composition,
    },
    BuiltinType {
        name: "CONTAINS",
        description: "The source concept includes the target as a component",
        category: Category::Composition,
    },
    BuiltinType {
        name: "COMPOSED_OF",
        description: "The source concept is built from instances of the target",
        category: Category::Composition,
    },
    // Logical
    BuiltinType {
        name: "IMPLIES",
        description: "If the source concept holds, the target follows",
        category: Category::Logical,
    },
    BuiltinType {
        name: "EQUIVALENT_TO",
        description: "The source and target concepts are logically interchangeable",
        category: Category::Logical,
    },
    BuiltinType {
        name: "CONTRASTS_WITH",
        description: "The source concept stands in explicit opposition of framing to the target",
        category: Category::Logical,
    },
    // Evidential (contains four of the five default polarity pairs)
    BuiltinType {
        name: "SUPPORTS",
        description: "Evidence from the source concept strengthens the target",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "CONTRADICTS",
        description: "Evidence from the source concept undermines the target",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "VALIDATES",
        description: "The source concept confirms the target through testing or proof",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "REFUTES",
        description: "The source concept disproves the target through testing or proof",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "CONFIRMS",
        description: "The source concept independently verifies the target",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "DISPROVES",
        description: "The source concept independently invalidates the target",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "REINFORCES",
        description: "The source concept adds weight to the target's standing",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "OPPOSES",
        description: "The source concept works against the target's standing",
        category: Category::Evidential,
    },
    BuiltinType {
        name: "EXEMPLIFIES",
        description: "The source concept is a concrete example of the target",
        category: Category::Evidential,
    },
    // Semantic
    BuiltinType {
        name: "RELATES_TO",
        description: "The source and target concepts are topically connected",
        category: Category::Semantic,
    },
    BuiltinType {
        name: "SIMILAR_TO",
        description: "The source and target concepts share most of their meaning",
        category: Category::Semantic,
    },
    BuiltinType {
        name: "DEFINES",
        description: "The source concept gives the meaning of the target",
        category: Category::Semantic,
    },
    BuiltinType {
        name: "REFERENCES",
        description: "The source concept explicitly mentions the target",
        category: Category::Semantic,
    },
    // Temporal
    BuiltinType {
        name: "PRECEDES",
        description: "The source concept happens before the target",
        category: Category::Temporal,
    },
    BuiltinType {
        name: "FOLLOWS",
        description: "The source concept happens after the target",
        category: Category::Temporal,
    },
    BuiltinType {
        name: "CONCURRENT_WITH",
        description: "The source and target concepts happen together",
        category: Category::Temporal,
    },
    // Dependency
    BuiltinType {
        name: "DEPENDS_ON",
        description: "The source concept needs the target to function",
        category: Category::Dependency,
    },
    BuiltinType {
        name: "REQUIRES",
        description: "The source concept cannot exist without the target",
        category: Category::Dependency,
    },
    // Derivation
    BuiltinType {
        name: "DERIVED_FROM",
        description: "The source concept was produced from the target",
        category: Category::Derivation,
    },
    BuiltinType {
        name: "SPECIALIZES",
        description: "The source concept is a narrower form of the target",
        category: Category::Derivation,
    },
];

/// Install missing builtin types into the registry
///
/// Idempotent: existing rows, including curator-modified ones, are left
/// untouched. Returns the number inserted.
pub fn install_builtin_vocab(store: &GraphStore) -> Result<usize> {
    let now = Utc::now();
    let mut installed = 0usize;

    for builtin in BUILTIN_TYPES {
        if store.get_vocab_type(builtin.name)?.is_some() {
            continue;
        }
        store.upsert_vocab_type(&VocabType {
            name: builtin.name.to_string(),
            description: builtin.description.to_string(),
            category: builtin.category,
            category_confidence: 1.0,
            ambiguous: false,
            runner_up_category: None,
            is_builtin: true,
            is_active: true,
            usage_count: 0,
            embedding: None,
            embedding_dimension: None,
            embedding_model: None,
            semantic_role: SemanticRole::Unclassified,
            grounding_stats: None,
            created_at: now,
            updated_at: now,
        })?;
        installed += 1;
    }

    if installed > 0 {
        tracing::info!(installed, "installed builtin vocabulary types");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exactly_thirty_seed_types() {
        assert_eq!(BUILTIN_TYPES.len(), 30);
        let names: HashSet<&str> = BUILTIN_TYPES.iter().map(|b| b.name).collect();
        assert_eq!(names.len(), 30);
    }

    #[test]
    fn test_every_category_has_a_seed() {
        let covered: HashSet<Category> = BUILTIN_TYPES.iter().map(|b| b.category).collect();
        assert_eq!(covered.len(), Category::ALL.len());
    }

    #[test]
    fn test_default_polarity_pairs_are_all_builtin() {
        let names: HashSet<&str> = BUILTIN_TYPES.iter().map(|b| b.name).collect();
        for (positive, negative) in crate::config::default_polarity_pairs() {
            assert!(names.contains(positive.as_str()), "{} missing", positive);
            assert!(names.contains(negative.as_str()), "{} missing", negative);
        }
    }

    #[test]
    fn test_names_are_uppercase_identifiers() {
        for builtin in BUILTIN_TYPES {
            assert!(
                builtin
                    .name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c == '_'),
                "{} is not an uppercase identifier",
                builtin.name
            );
        }
    }
}
