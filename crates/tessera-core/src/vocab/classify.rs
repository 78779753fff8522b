//! Probabilistic Category Classification
//!
//! Scores a type's embedding against the 30 builtin seed embeddings grouped
//! by category. `score(cat) = max` seed similarity within the category —
//! max, not mean, because categories contain opposing poles (ENABLES and
//! PREVENTS are both causation; averaging them would cancel out exactly the
//! types the category exists to hold).

use std::collections::HashMap;

use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::storage::GraphStore;
use crate::vocab::registry::VocabRegistry;
use crate::vocab::{Category, VocabSnapshot};

/// Outcome of classifying one type
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryClassification {
    pub primary: Category,
    /// Max seed similarity backing the primary assignment
    pub confidence: f64,
    pub runner_up: Option<Category>,
    pub runner_up_score: f64,
    /// Runner-up scored above the ambiguity threshold
    pub ambiguous: bool,
}

/// Seed embeddings grouped by category, extracted from a snapshot
pub fn seed_embeddings(snapshot: &VocabSnapshot) -> Vec<(Category, Vec<f32>)> {
    snapshot
        .types()
        .filter(|vt| vt.is_builtin)
        .filter_map(|vt| {
            vt.embedding
                .as_ref()
                .map(|embedding| (vt.category, embedding.clone()))
        })
        .collect()
}

/// Per-category max seed similarity, descending
pub fn score_categories(
    embedding: &[f32],
    seeds: &[(Category, Vec<f32>)],
) -> Vec<(Category, f64)> {
    let mut best: HashMap<Category, f64> = HashMap::new();
    for (category, seed) in seeds {
        let similarity = cosine_similarity(embedding, seed) as f64;
        let entry = best.entry(*category).or_insert(f64::NEG_INFINITY);
        if similarity > *entry {
            *entry = similarity;
        }
    }
    let mut scores: Vec<(Category, f64)> = best.into_iter().collect();
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scores
}

/// Classify one embedding against the seed set
///
/// None when there are no scored seeds to compare against.
pub fn classify(
    embedding: &[f32],
    seeds: &[(Category, Vec<f32>)],
    ambiguity_threshold: f64,
) -> Option<CategoryClassification> {
    let scores = score_categories(embedding, seeds);
    let (primary, confidence) = *scores.first()?;
    let (runner_up, runner_up_score) = scores
        .get(1)
        .map(|(cat, score)| (Some(*cat), *score))
        .unwrap_or((None, 0.0));

    Some(CategoryClassification {
        primary,
        confidence,
        runner_up,
        runner_up_score,
        ambiguous: runner_up_score >= ambiguity_threshold,
    })
}

/// Classify every embedded custom type and persist the results
///
/// Builtin seeds keep their declared categories. Returns the number of
/// types classified.
pub fn run_classification(
    store: &GraphStore,
    registry: &VocabRegistry,
    ambiguity_threshold: f64,
) -> Result<usize> {
    let snapshot = registry.snapshot();
    let seeds = seed_embeddings(&snapshot);
    if seeds.is_empty() {
        tracing::warn!("no embedded seeds, skipping category classification");
        return Ok(0);
    }

    let mut classified = 0usize;
    for vocab_type in snapshot.types().filter(|vt| !vt.is_builtin) {
        let Some(embedding) = vocab_type.embedding.as_ref() else {
            continue;
        };
        let Some(result) = classify(embedding, &seeds, ambiguity_threshold) else {
            continue;
        };
        store.set_vocab_classification(
            &vocab_type.name,
            result.primary,
            result.confidence,
            result.ambiguous,
            result.runner_up.filter(|_| result.ambiguous),
        )?;
        classified += 1;
    }

    if classified > 0 {
        registry.reload()?;
    }
    Ok(classified)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeds() -> Vec<(Category, Vec<f32>)> {
        vec![
            // Two opposing causation poles on the same axis
            (Category::Causation, vec![1.0, 0.0, 0.0]),
            (Category::Causation, vec![-1.0, 0.0, 0.0]),
            (Category::Temporal, vec![0.0, 1.0, 0.0]),
            (Category::Composition, vec![0.0, 0.0, 1.0]),
        ]
    }

    #[test]
    fn test_max_not_mean_handles_opposing_poles() {
        // A vector aligned with the negative causation pole: mean scoring
        // would put causation near zero, max keeps it at 1.0
        let result = classify(&[-1.0, 0.0, 0.0], &seeds(), 0.70).unwrap();
        assert_eq!(result.primary, Category::Causation);
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ambiguity_flag() {
        // Equidistant between causation and temporal
        let v = [0.707, 0.707, 0.0];
        let ambiguous = classify(&v, &seeds(), 0.70).unwrap();
        assert!(ambiguous.ambiguous);
        assert!(ambiguous.runner_up.is_some());

        // Clearly composition: runner-up far below threshold
        let clear = classify(&[0.05, 0.0, 1.0], &seeds(), 0.70).unwrap();
        assert_eq!(clear.primary, Category::Composition);
        assert!(!clear.ambiguous);
    }

    #[test]
    fn test_empty_seed_set_gives_none() {
        assert!(classify(&[1.0, 0.0, 0.0], &[], 0.70).is_none());
    }

    #[test]
    fn test_scores_are_sorted_descending() {
        let scores = score_categories(&[1.0, 0.2, 0.0], &seeds());
        for pair in scores.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        assert_eq!(scores[0].0, Category::Causation);
    }
}
