//! Synonym Detection & Vocabulary Consolidation
//!
//! Ranks active type pairs by embedding similarity and shrinks the
//! vocabulary toward a target size. Near-duplicates with an unused side are
//! pruned automatically; everything else goes to the reasoning provider as
//! structured numeric scores for a typed merge/skip decision.
//!
//! Live mode re-queries candidates after every merge: a merge changes usage
//! counts and the active set, so similarities ranked against the old state
//! go stale immediately. Dry-run scores all candidates against the initial
//! snapshot and writes nothing.

use std::collections::HashSet;
use std::sync::Arc;

use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::providers::{DecisionContext, ReasoningProvider, RetryPolicy, with_retries};
use crate::storage::GraphStore;
use crate::vocab::registry::VocabRegistry;
use crate::vocab::VocabSnapshot;

/// Similarity at which a pair becomes a synonym candidate
pub const SYNONYM_CANDIDATE_THRESHOLD: f32 = 0.70;

/// Similarity at which an unused side is pruned without a provider call
pub const AUTO_PRUNE_THRESHOLD: f32 = 0.90;

/// One consolidation decision
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidateOutcome {
    /// "merge", "prune" or "skip"
    pub action: String,
    /// The type that was (or would be) deactivated
    pub deprecated: String,
    /// The surviving type for merge/prune outcomes
    pub survivor: Option<String>,
    pub similarity: f32,
    pub rationale: String,
}

/// Result of a consolidation run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidateReport {
    pub dry_run: bool,
    pub initial_active: usize,
    pub final_active: usize,
    pub outcomes: Vec<ConsolidateOutcome>,
    /// Zero-usage custom types deleted after the merge loop
    pub pruned_zero_usage: Vec<String>,
}

/// A ranked synonym candidate pair
#[derive(Debug, Clone)]
struct Candidate {
    a: String,
    b: String,
    similarity: f32,
}

/// Vocabulary consolidation engine
pub struct VocabConsolidator {
    store: Arc<GraphStore>,
    registry: Arc<VocabRegistry>,
    reasoning: Arc<dyn ReasoningProvider>,
    retry: RetryPolicy,
}

impl VocabConsolidator {
    pub fn new(
        store: Arc<GraphStore>,
        registry: Arc<VocabRegistry>,
        reasoning: Arc<dyn ReasoningProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            reasoning,
            retry: RetryPolicy::default(),
        }
    }

    /// Shrink the active vocabulary toward `target_size`
    ///
    /// No-op in live mode when the active size is already at or under the
    /// target.
    pub async fn consolidate(&self, target_size: usize, dry_run: bool) -> Result<ConsolidateReport> {
        let initial_active = self.registry.snapshot().active_count();

        if dry_run {
            return self.dry_run_report(initial_active).await;
        }
        if initial_active <= target_size {
            return Ok(ConsolidateReport {
                dry_run: false,
                initial_active,
                final_active: initial_active,
                outcomes: Vec::new(),
                pruned_zero_usage: Vec::new(),
            });
        }

        let mut outcomes = Vec::new();
        let mut dismissed: HashSet<(String, String)> = HashSet::new();

        loop {
            let snapshot = self.registry.snapshot();
            if snapshot.active_count() <= target_size {
                break;
            }

            let next = candidate_pairs(&snapshot)
                .into_iter()
                .find(|c| !dismissed.contains(&pair_key(&c.a, &c.b)));
            let Some(candidate) = next else {
                break;
            };

            let (survivor, deprecated) = pick_survivor(&snapshot, &candidate.a, &candidate.b);
            let outcome = self
                .evaluate_candidate(&snapshot, &survivor, &deprecated, candidate.similarity)
                .await?;

            match outcome.action.as_str() {
                "merge" | "prune" => {
                    self.execute_merge(&deprecated, &survivor)?;
                    outcomes.push(outcome);
                    // Vocabulary state changed: candidates re-ranked next pass
                }
                _ => {
                    dismissed.insert(pair_key(&candidate.a, &candidate.b));
                    outcomes.push(outcome);
                }
            }
        }

        let pruned_zero_usage = self.prune_zero_usage_customs()?;
        let final_active = self.registry.snapshot().active_count();

        tracing::info!(
            initial_active,
            final_active,
            merges = outcomes.iter().filter(|o| o.action != "skip").count(),
            "vocabulary consolidation complete"
        );

        Ok(ConsolidateReport {
            dry_run: false,
            initial_active,
            final_active,
            outcomes,
            pruned_zero_usage,
        })
    }

    /// Evaluate every candidate against the initial snapshot, writing nothing
    async fn dry_run_report(&self, initial_active: usize) -> Result<ConsolidateReport> {
        let snapshot = self.registry.snapshot();
        let mut outcomes = Vec::new();

        for candidate in candidate_pairs(&snapshot) {
            let (survivor, deprecated) = pick_survivor(&snapshot, &candidate.a, &candidate.b);
            outcomes.push(
                self.evaluate_candidate(&snapshot, &survivor, &deprecated, candidate.similarity)
                    .await?,
            );
        }

        Ok(ConsolidateReport {
            dry_run: true,
            initial_active,
            final_active: initial_active,
            outcomes,
            pruned_zero_usage: Vec::new(),
        })
    }

    /// Decide what to do with one candidate pair
    async fn evaluate_candidate(
        &self,
        snapshot: &VocabSnapshot,
        survivor: &str,
        deprecated: &str,
        similarity: f32,
    ) -> Result<ConsolidateOutcome> {
        let deprecated_edges = self.store.count_edges_for_type(deprecated)?;
        let survivor_edges = self.store.count_edges_for_type(survivor)?;

        if similarity >= AUTO_PRUNE_THRESHOLD && deprecated_edges == 0 {
            return Ok(ConsolidateOutcome {
                action: "prune".to_string(),
                deprecated: deprecated.to_string(),
                survivor: Some(survivor.to_string()),
                similarity,
                rationale: "near-duplicate with zero edges".to_string(),
            });
        }

        let usage = |name: &str| snapshot.get(name).map(|vt| vt.usage_count).unwrap_or(0);
        let context = DecisionContext {
            subject: format!("merge {} into {}", deprecated, survivor),
            action_space: vec!["merge".to_string(), "skip".to_string()],
            scores: serde_json::json!({
                "similarity": similarity,
                "deprecatedEdges": deprecated_edges,
                "survivorEdges": survivor_edges,
                "deprecatedUsage": usage(deprecated),
                "survivorUsage": usage(survivor),
            }),
            summary: format!(
                "{} and {} are synonym candidates at cosine {:.3}",
                deprecated, survivor, similarity
            ),
        };

        let decision = with_retries(&self.retry, "vocab_merge_decision", || {
            let reasoning = Arc::clone(&self.reasoning);
            let context = context.clone();
            async move { reasoning.decide(&context).await }
        })
        .await?;

        let action = if decision.action == "merge" { "merge" } else { "skip" };
        Ok(ConsolidateOutcome {
            action: action.to_string(),
            deprecated: deprecated.to_string(),
            survivor: (action == "merge").then(|| survivor.to_string()),
            similarity,
            rationale: decision.rationale,
        })
    }

    /// Repoint edges and deactivate the deprecated side
    fn execute_merge(&self, deprecated: &str, survivor: &str) -> Result<()> {
        let moved = self.store.repoint_edges(deprecated, survivor)?;
        self.store.set_vocab_active(deprecated, false)?;
        self.registry.note_change(1)?;
        self.registry.reload()?;
        tracing::info!(deprecated, survivor, moved, "merged vocabulary type");
        Ok(())
    }

    /// Delete inactive custom types with zero usage
    fn prune_zero_usage_customs(&self) -> Result<Vec<String>> {
        let snapshot = self.registry.snapshot();
        let doomed: Vec<String> = snapshot
            .types()
            .filter(|vt| !vt.is_builtin && !vt.is_active && vt.usage_count == 0)
            .map(|vt| vt.name.clone())
            .collect();

        for name in &doomed {
            self.store.delete_vocab_type(name)?;
        }
        if !doomed.is_empty() {
            self.registry.note_change(doomed.len() as i64)?;
            self.registry.reload()?;
        }
        Ok(doomed)
    }
}

/// Active pairs at or above the candidate threshold, best first
fn candidate_pairs(snapshot: &VocabSnapshot) -> Vec<Candidate> {
    let embedded: Vec<(&str, &[f32])> = {
        let mut list: Vec<(&str, &[f32])> = snapshot
            .types()
            .filter(|vt| vt.is_active)
            .filter_map(|vt| vt.embedding.as_deref().map(|e| (vt.name.as_str(), e)))
            .collect();
        list.sort_by_key(|(name, _)| *name);
        list
    };

    let mut candidates = Vec::new();
    for i in 0..embedded.len() {
        for j in (i + 1)..embedded.len() {
            let similarity = cosine_similarity(embedded[i].1, embedded[j].1);
            if similarity >= SYNONYM_CANDIDATE_THRESHOLD {
                candidates.push(Candidate {
                    a: embedded[i].0.to_string(),
                    b: embedded[j].0.to_string(),
                    similarity,
                });
            }
        }
    }
    candidates.sort_by(|x, y| {
        y.similarity
            .partial_cmp(&x.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

/// Decide which side of a pair survives a merge
///
/// Builtin beats custom; then higher usage; then the lexicographically
/// smaller name for determinism.
fn pick_survivor(snapshot: &VocabSnapshot, a: &str, b: &str) -> (String, String) {
    let rank = |name: &str| {
        snapshot
            .get(name)
            .map(|vt| (vt.is_builtin, vt.usage_count))
            .unwrap_or((false, 0))
    };
    let (a_builtin, a_usage) = rank(a);
    let (b_builtin, b_usage) = rank(b);

    let a_wins = match (a_builtin, b_builtin) {
        (true, false) => true,
        (false, true) => false,
        _ => match a_usage.cmp(&b_usage) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => a < b,
        },
    };

    if a_wins {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, Precision};
    use crate::providers::mock::ScriptedReasoningProvider;
    use crate::vocab::builtin::install_builtin_vocab;

    fn setup() -> (
        tempfile::TempDir,
        Arc<GraphStore>,
        Arc<VocabRegistry>,
        Arc<ScriptedReasoningProvider>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: "static-test".into(),
            model_name: "m".into(),
            dimension: 4,
            precision: Precision::Float32,
        };
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config).unwrap(),
        );
        install_builtin_vocab(&store).unwrap();
        let registry = Arc::new(VocabRegistry::new(Arc::clone(&store)).unwrap());
        let reasoning = Arc::new(ScriptedReasoningProvider::new());
        (dir, store, registry, reasoning)
    }

    fn set_embedding(store: &GraphStore, registry: &VocabRegistry, name: &str, v: Vec<f32>) {
        store.set_vocab_embedding(name, &v, "m").unwrap();
        registry.reload().unwrap();
    }

    fn consolidator(
        store: &Arc<GraphStore>,
        registry: &Arc<VocabRegistry>,
        reasoning: &Arc<ScriptedReasoningProvider>,
    ) -> VocabConsolidator {
        VocabConsolidator::new(
            Arc::clone(store),
            Arc::clone(registry),
            Arc::clone(reasoning) as Arc<dyn ReasoningProvider>,
        )
    }

    #[tokio::test]
    async fn test_noop_at_or_under_target() {
        let (_dir, store, registry, reasoning) = setup();
        let consolidator = consolidator(&store, &registry, &reasoning);
        let report = consolidator.consolidate(100, false).await.unwrap();
        assert_eq!(report.initial_active, report.final_active);
        assert!(report.outcomes.is_empty());
        assert!(reasoning.decide_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_prune_skips_provider() {
        let (_dir, store, registry, reasoning) = setup();
        registry.register_custom("FACILITATES", "makes easier").unwrap();

        // FACILITATES is nearly identical to ENABLES and has zero edges
        set_embedding(&store, &registry, "ENABLES", vec![1.0, 0.0, 0.0, 0.0]);
        set_embedding(&store, &registry, "FACILITATES", vec![0.999, 0.01, 0.0, 0.0]);

        let consolidator = consolidator(&store, &registry, &reasoning);
        let report = consolidator.consolidate(30, false).await.unwrap();

        assert!(report.outcomes.iter().any(|o| o.action == "prune"
            && o.deprecated == "FACILITATES"
            && o.survivor.as_deref() == Some("ENABLES")));
        assert!(!registry.snapshot().is_active("FACILITATES"));
        // Zero-usage custom removed entirely after the loop
        assert!(report.pruned_zero_usage.contains(&"FACILITATES".to_string()));
        assert!(store.get_vocab_type("FACILITATES").unwrap().is_none());
        // No provider call was needed
        assert!(reasoning.decide_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_merge_repoints_edges() {
        let (_dir, store, registry, reasoning) = setup();
        registry.register_custom("BOOSTS", "strengthens").unwrap();

        // Similar but not auto-prunable: the custom side has edges
        set_embedding(&store, &registry, "SUPPORTS", vec![1.0, 0.0, 0.0, 0.0]);
        set_embedding(&store, &registry, "BOOSTS", vec![0.9, 0.3, 0.0, 0.0]);

        let a = store
            .upsert_concept("Alpha", &[], &[1.0, 0.0, 0.0, 0.0], None, 0.99)
            .unwrap()
            .concept_id;
        let b = store
            .upsert_concept("Beta", &[], &[0.0, 1.0, 0.0, 0.0], None, 0.99)
            .unwrap()
            .concept_id;
        store.add_edge(&a, "BOOSTS", &b, 0.9, None).unwrap();
        registry.reload().unwrap();

        reasoning.push_decision("merge", "same evidential meaning");
        let consolidator = consolidator(&store, &registry, &reasoning);
        let report = consolidator.consolidate(30, false).await.unwrap();

        assert!(report
            .outcomes
            .iter()
            .any(|o| o.action == "merge" && o.deprecated == "BOOSTS"));
        assert_eq!(store.count_edges_for_type("BOOSTS").unwrap(), 0);
        assert_eq!(store.count_edges_for_type("SUPPORTS").unwrap(), 1);

        // The provider saw numeric context, never a bare prompt
        let calls = reasoning.decide_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].scores.get("similarity").is_some());
        assert!(calls[0].scores.get("deprecatedEdges").is_some());
    }

    #[tokio::test]
    async fn test_skip_decision_is_dismissed_not_retried() {
        let (_dir, store, registry, reasoning) = setup();
        registry.register_custom("BOOSTS", "strengthens").unwrap();
        set_embedding(&store, &registry, "SUPPORTS", vec![1.0, 0.0, 0.0, 0.0]);
        set_embedding(&store, &registry, "BOOSTS", vec![0.9, 0.3, 0.0, 0.0]);

        let a = store
            .upsert_concept("Alpha", &[], &[1.0, 0.0, 0.0, 0.0], None, 0.99)
            .unwrap()
            .concept_id;
        let b = store
            .upsert_concept("Beta", &[], &[0.0, 1.0, 0.0, 0.0], None, 0.99)
            .unwrap()
            .concept_id;
        store.add_edge(&a, "BOOSTS", &b, 0.9, None).unwrap();
        registry.reload().unwrap();

        // Default scripted decision is skip; the pair must be asked once
        let consolidator = consolidator(&store, &registry, &reasoning);
        let report = consolidator.consolidate(1, false).await.unwrap();

        let skip_count = report
            .outcomes
            .iter()
            .filter(|o| o.action == "skip" && o.deprecated == "BOOSTS")
            .count();
        assert_eq!(skip_count, 1);
        assert!(registry.snapshot().is_active("BOOSTS"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (_dir, store, registry, reasoning) = setup();
        registry.register_custom("FACILITATES", "makes easier").unwrap();
        set_embedding(&store, &registry, "ENABLES", vec![1.0, 0.0, 0.0, 0.0]);
        set_embedding(&store, &registry, "FACILITATES", vec![0.999, 0.01, 0.0, 0.0]);

        let before = registry.snapshot().active_count();
        let consolidator = consolidator(&store, &registry, &reasoning);
        let report = consolidator.consolidate(0, true).await.unwrap();

        assert!(report.dry_run);
        assert!(!report.outcomes.is_empty());
        assert_eq!(registry.snapshot().active_count(), before);
        assert!(store.get_vocab_type("FACILITATES").unwrap().is_some());
    }

    #[test]
    fn test_pick_survivor_prefers_builtin_then_usage() {
        let (_dir, _store, registry, _) = setup();
        registry.register_custom("BOOSTS", "x").unwrap();
        let snapshot = registry.snapshot();

        let (survivor, deprecated) = pick_survivor(&snapshot, "BOOSTS", "SUPPORTS");
        assert_eq!(survivor, "SUPPORTS");
        assert_eq!(deprecated, "BOOSTS");

        // Both builtin, equal usage: lexicographic
        let (survivor, _) = pick_survivor(&snapshot, "VALIDATES", "CONFIRMS");
        assert_eq!(survivor, "CONFIRMS");
    }
}
