//! Semantic-Role Measurement
//!
//! Measures what each relationship type actually does to grounding by
//! sampling its edges and projecting the type embedding onto the default
//! polarity axis. Roles come from measurement, not from the name — the one
//! exception is the temporal lexicon, which marks ordering vocabulary as
//! HISTORICAL regardless of projection.

use chrono::Utc;

use crate::embeddings::dot_product;
use crate::error::Result;
use crate::storage::GraphStore;
use crate::vocab::registry::VocabRegistry;
use crate::vocab::{GroundingStats, SemanticRole};

/// Minimum sampled edges for a numeric verdict
pub const MIN_ROLE_SAMPLES: usize = 3;

/// Name fragments that mark a type as ordering vocabulary
const TEMPORAL_LEXICON: &[&str] = &[
    "PRECEDES",
    "FOLLOWS",
    "BEFORE",
    "AFTER",
    "HISTORICAL",
    "SUPERSEDES",
    "CONCURRENT",
    "EVOLVED",
];

/// Whether a type name matches the temporal lexicon
pub fn is_temporal_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    TEMPORAL_LEXICON.iter().any(|term| upper.contains(term))
}

/// Derive a role from measured grounding statistics
pub fn role_from_stats(name: &str, stats: Option<&GroundingStats>) -> SemanticRole {
    if is_temporal_name(name) {
        return SemanticRole::Historical;
    }
    let Some(stats) = stats else {
        return SemanticRole::InsufficientData;
    };
    if stats.sample_size < MIN_ROLE_SAMPLES {
        return SemanticRole::InsufficientData;
    }
    if stats.avg > 0.8 {
        SemanticRole::Affirmative
    } else if stats.avg < -0.5 {
        SemanticRole::Contradictory
    } else if stats.avg >= 0.2 {
        SemanticRole::Contested
    } else {
        SemanticRole::Unclassified
    }
}

/// Measure and persist roles for every active type
///
/// `axis` is the default polarity axis (unit-norm); with no axis available
/// every non-temporal type falls back to INSUFFICIENT_DATA. Resets the
/// vocabulary change counter on completion. Returns types measured.
pub fn measure_roles(
    store: &GraphStore,
    registry: &VocabRegistry,
    axis: Option<&[f32]>,
    sample_size: usize,
) -> Result<usize> {
    let snapshot = registry.snapshot();
    let mut measured = 0usize;

    for vocab_type in snapshot.types().filter(|vt| vt.is_active) {
        let projection = match (axis, vocab_type.embedding.as_ref()) {
            (Some(axis), Some(embedding)) if embedding.len() == axis.len() => {
                Some(dot_product(embedding, axis) as f64)
            }
            _ => None,
        };

        let edges = store.sample_edges_for_type(&vocab_type.name, sample_size)?;
        let stats = projection.map(|projection| {
            // Per-edge contribution is the confidence-weighted projection,
            // matching the grounding aggregate a target concept would see
            let values: Vec<f64> = edges
                .iter()
                .map(|edge| edge.confidence as f64 * projection)
                .collect();
            let total_confidence: f64 = edges.iter().map(|e| e.confidence as f64).sum();
            let avg = if total_confidence > 0.0 {
                values.iter().sum::<f64>() / total_confidence
            } else {
                0.0
            };
            let mean_value = if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            };
            let variance = if values.is_empty() {
                0.0
            } else {
                values
                    .iter()
                    .map(|v| (v - mean_value).powi(2))
                    .sum::<f64>()
                    / values.len() as f64
            };
            GroundingStats {
                avg,
                variance,
                sample_size: edges.len(),
                measured_at: Utc::now(),
            }
        });

        let role = role_from_stats(&vocab_type.name, stats.as_ref());
        store.set_vocab_role(&vocab_type.name, role, stats)?;
        measured += 1;
    }

    registry.reset_changes()?;
    registry.reload()?;
    tracing::info!(measured, "semantic role measurement complete");
    Ok(measured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(avg: f64, samples: usize) -> GroundingStats {
        GroundingStats {
            avg,
            variance: 0.0,
            sample_size: samples,
            measured_at: Utc::now(),
        }
    }

    #[test]
    fn test_role_bands() {
        assert_eq!(
            role_from_stats("SUPPORTS", Some(&stats(0.9, 10))),
            SemanticRole::Affirmative
        );
        assert_eq!(
            role_from_stats("DISPUTED", Some(&stats(0.5, 10))),
            SemanticRole::Contested
        );
        assert_eq!(
            role_from_stats("CONTRADICTS", Some(&stats(-0.7, 10))),
            SemanticRole::Contradictory
        );
        // The gap between -0.5 and 0.2 is deliberately unclassified
        assert_eq!(
            role_from_stats("PART_OF", Some(&stats(0.01, 10))),
            SemanticRole::Unclassified
        );
        assert_eq!(
            role_from_stats("OPPOSES", Some(&stats(-0.3, 10))),
            SemanticRole::Unclassified
        );
    }

    #[test]
    fn test_band_boundaries() {
        // 0.8 itself is contested, not affirmative; 0.2 is contested
        assert_eq!(
            role_from_stats("X", Some(&stats(0.8, 5))),
            SemanticRole::Contested
        );
        assert_eq!(
            role_from_stats("X", Some(&stats(0.2, 5))),
            SemanticRole::Contested
        );
        assert_eq!(
            role_from_stats("X", Some(&stats(-0.5, 5))),
            SemanticRole::Unclassified
        );
    }

    #[test]
    fn test_insufficient_data() {
        assert_eq!(
            role_from_stats("SUPPORTS", Some(&stats(0.9, 2))),
            SemanticRole::InsufficientData
        );
        assert_eq!(role_from_stats("SUPPORTS", None), SemanticRole::InsufficientData);
    }

    #[test]
    fn test_temporal_lexicon_wins_over_measurement() {
        assert_eq!(
            role_from_stats("PRECEDES", Some(&stats(0.95, 50))),
            SemanticRole::Historical
        );
        assert!(is_temporal_name("concurrent_with"));
        assert!(is_temporal_name("SUPERSEDED_BY"));
        assert!(!is_temporal_name("SUPPORTS"));
    }
}
