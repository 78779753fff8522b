//! Polarity Axis Construction
//!
//! The default axis is the unit-normalized mean of pair-difference vectors
//! over the configured (positive, negative) vocabulary pairs. Pairs missing
//! an embedding on either side are skipped; with no usable pair there is no
//! axis and grounding is defined as 0.0 everywhere.

use crate::embeddings::{difference, normalize_in_place};
use crate::vocab::VocabSnapshot;

/// Build the polarity axis from vocabulary pairs
///
/// Returns None when no pair has both sides embedded at `dimension`.
pub fn build_axis(
    pairs: &[(String, String)],
    snapshot: &VocabSnapshot,
    dimension: usize,
) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f32; dimension];
    let mut used = 0usize;

    for (positive, negative) in pairs {
        let (Some(pos), Some(neg)) = (
            snapshot.embedding_of(positive),
            snapshot.embedding_of(negative),
        ) else {
            continue;
        };
        if pos.len() != dimension || neg.len() != dimension {
            continue;
        }
        let delta = difference(pos, neg);
        for (acc, d) in sum.iter_mut().zip(delta.iter()) {
            *acc += d;
        }
        used += 1;
    }

    if used == 0 {
        return None;
    }
    for value in sum.iter_mut() {
        *value /= used as f32;
    }
    normalize_in_place(&mut sum);

    // All pairs cancelling out exactly leaves nothing to project onto
    if sum.iter().all(|v| *v == 0.0) {
        return None;
    }
    Some(sum)
}

/// Confidence-weighted grounding aggregate over (projection, confidence)
///
/// `Σ c·π / Σ c`; zero total confidence (or no edges) is 0.0 by definition.
pub fn aggregate_grounding(contributions: &[(f32, f32)]) -> f32 {
    let total_confidence: f32 = contributions.iter().map(|(_, c)| c).sum();
    if total_confidence <= 0.0 {
        return 0.0;
    }
    let weighted: f32 = contributions.iter().map(|(p, c)| p * c).sum();
    weighted / total_confidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::norm;

    #[test]
    fn test_aggregate_matches_worked_example() {
        // SUPPORTS projects 0.42 at confidence 1.0, PART_OF projects 0.01
        // at confidence 1.0: (0.42 + 0.01) / 2.0
        let grounding = aggregate_grounding(&[(0.42, 1.0), (0.01, 1.0)]);
        assert!((grounding - 0.215).abs() < 1e-6);
    }

    #[test]
    fn test_aggregate_zero_cases() {
        assert_eq!(aggregate_grounding(&[]), 0.0);
        assert_eq!(aggregate_grounding(&[(0.9, 0.0)]), 0.0);
    }

    #[test]
    fn test_aggregate_confidence_weighting() {
        // High-confidence positive outweighs low-confidence negative
        let grounding = aggregate_grounding(&[(0.8, 1.0), (-0.8, 0.25)]);
        assert!(grounding > 0.0);
        assert!((grounding - (0.8 - 0.2) / 1.25).abs() < 1e-6);
    }

    // Axis construction is exercised against a real snapshot in the engine
    // tests; the pure negation property lives here.
    #[test]
    fn test_axis_negation_symmetry() {
        use crate::embeddings::dot_product;
        let pos = vec![0.8f32, 0.6, 0.0];
        let neg = vec![-0.6f32, 0.8, 0.0];

        let mut forward = difference(&pos, &neg);
        normalize_in_place(&mut forward);
        let mut reverse = difference(&neg, &pos);
        normalize_in_place(&mut reverse);

        assert!((norm(&forward) - 1.0).abs() < 1e-6);
        for (f, r) in forward.iter().zip(reverse.iter()) {
            assert!((f + r).abs() < 1e-6);
        }
        // Projections flip sign with the axis
        let v = vec![0.3f32, 0.9, 0.1];
        assert!((dot_product(&v, &forward) + dot_product(&v, &reverse)).abs() < 1e-6);
    }
}
