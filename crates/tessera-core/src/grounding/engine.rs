//! Grounding Engine
//!
//! For any concept, a scalar in [-1, 1] summarizing incoming evidential and
//! causal pressure: the confidence-weighted mean of its incoming edge
//! types' projections onto the default polarity axis.
//!
//! Two-tier caching: the axis is recomputed only when the vocabulary
//! generation moves; per-concept grounding sits in an LRU invalidated on
//! incoming-edge writes and embedding regeneration.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::config::ConfigRegistry;
use crate::embeddings::dot_product;
use crate::error::{EngineError, Result};
use crate::grounding::axis::{aggregate_grounding, build_axis};
use crate::storage::GraphStore;
use crate::vocab::VocabRegistry;

/// Per-concept grounding LRU capacity
const GROUNDING_CACHE_SIZE: usize = 1024;

struct CachedAxis {
    vector: Option<Vec<f32>>,
    vocab_generation: u64,
}

/// Concept-relative grounding over the default polarity axis
pub struct GroundingEngine {
    store: Arc<GraphStore>,
    vocab: Arc<VocabRegistry>,
    config: Arc<ConfigRegistry>,
    axis_cache: Mutex<Option<CachedAxis>>,
    concept_cache: Mutex<LruCache<String, f32>>,
}

impl GroundingEngine {
    pub fn new(
        store: Arc<GraphStore>,
        vocab: Arc<VocabRegistry>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            store,
            vocab,
            config,
            axis_cache: Mutex::new(None),
            concept_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(GROUNDING_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// The default polarity axis, unit-norm, or None without usable pairs
    ///
    /// Cached against the vocabulary generation: vocabulary embedding
    /// changes are the only thing that moves the axis.
    pub fn polarity_axis(&self) -> Result<Option<Vec<f32>>> {
        let generation = self.vocab.generation();
        {
            let cache = self
                .axis_cache
                .lock()
                .map_err(|_| EngineError::Internal("axis cache lock poisoned".into()))?;
            if let Some(cached) = cache.as_ref() {
                if cached.vocab_generation == generation {
                    return Ok(cached.vector.clone());
                }
            }
        }

        let snapshot = self.vocab.snapshot();
        let pairs = self.config.settings().polarity_pairs;
        let vector = build_axis(&pairs, &snapshot, self.config.dimension());

        let mut cache = self
            .axis_cache
            .lock()
            .map_err(|_| EngineError::Internal("axis cache lock poisoned".into()))?;
        *cache = Some(CachedAxis {
            vector: vector.clone(),
            vocab_generation: generation,
        });
        // Axis moved, every cached concept grounding is stale with it
        if let Ok(mut concepts) = self.concept_cache.lock() {
            concepts.clear();
        }
        Ok(vector)
    }

    /// Grounding of one concept
    ///
    /// 0.0 for concepts with no incoming edges, with no axis available, or
    /// whose incoming confidence sums to zero. Structural relationship
    /// types project near zero and contribute near-zero grounding.
    pub fn grounding(&self, concept_id: &str) -> Result<f32> {
        {
            let mut cache = self
                .concept_cache
                .lock()
                .map_err(|_| EngineError::Internal("grounding cache lock poisoned".into()))?;
            if let Some(value) = cache.get(concept_id) {
                return Ok(*value);
            }
        }

        let value = self.compute_grounding(concept_id)?;
        self.concept_cache
            .lock()
            .map_err(|_| EngineError::Internal("grounding cache lock poisoned".into()))?
            .put(concept_id.to_string(), value);
        Ok(value)
    }

    fn compute_grounding(&self, concept_id: &str) -> Result<f32> {
        if self.store.get_concept(concept_id)?.is_none() {
            return Err(EngineError::NotFound(format!("concept {}", concept_id)));
        }

        let Some(axis) = self.polarity_axis()? else {
            return Ok(0.0);
        };

        let edges = self.store.incoming_edges(concept_id)?;
        if edges.is_empty() {
            return Ok(0.0);
        }

        let snapshot = self.vocab.snapshot();
        let contributions: Vec<(f32, f32)> = edges
            .iter()
            .filter_map(|edge| {
                let embedding = snapshot.embedding_of(&edge.rel_type)?;
                if embedding.len() != axis.len() {
                    return None;
                }
                Some((dot_product(embedding, &axis), edge.confidence))
            })
            .collect();

        Ok(aggregate_grounding(&contributions))
    }

    /// Drop the cached grounding of one concept (incoming-edge write)
    pub fn invalidate_concept(&self, concept_id: &str) {
        if let Ok(mut cache) = self.concept_cache.lock() {
            cache.pop(concept_id);
        }
    }

    /// Drop every cached value (embedding regeneration, config swap)
    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.concept_cache.lock() {
            cache.clear();
        }
        if let Ok(mut axis) = self.axis_cache.lock() {
            *axis = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiProviderConfig, EmbeddingConfig, EngineSettings, Precision};
    use crate::embeddings::normalize_in_place;
    use crate::providers::ProviderCapability;
    use crate::vocab::install_builtin_vocab;

    const DIM: usize = 4;

    fn setup() -> (
        tempfile::TempDir,
        Arc<GraphStore>,
        Arc<VocabRegistry>,
        GroundingEngine,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigRegistry::new(
            EmbeddingConfig {
                provider: "static-test".into(),
                model_name: "m".into(),
                dimension: DIM,
                precision: Precision::Float32,
            },
            AiProviderConfig {
                provider: "scripted-test".into(),
                model_name: "s".into(),
                capabilities: vec![ProviderCapability::Decide],
            },
            EngineSettings::default(),
        ));
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config.embedding()).unwrap(),
        );
        install_builtin_vocab(&store).unwrap();
        let vocab = Arc::new(VocabRegistry::new(Arc::clone(&store)).unwrap());
        let engine = GroundingEngine::new(Arc::clone(&store), Arc::clone(&vocab), config);
        (dir, store, vocab, engine)
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        normalize_in_place(&mut v);
        v
    }

    /// Give every polarity pair an embedding along the first dimension so
    /// the axis is exactly [1, 0, 0, 0]
    fn embed_polar_vocab(store: &GraphStore, vocab: &VocabRegistry) {
        for (positive, negative) in crate::config::default_polarity_pairs() {
            store
                .set_vocab_embedding(&positive, &unit(vec![1.0, 0.2, 0.0, 0.0]), "m")
                .unwrap();
            store
                .set_vocab_embedding(&negative, &unit(vec![-1.0, 0.2, 0.0, 0.0]), "m")
                .unwrap();
        }
        // A structural type orthogonal to the axis
        store
            .set_vocab_embedding("PART_OF", &unit(vec![0.0, 0.0, 1.0, 0.0]), "m")
            .unwrap();
        vocab.reload().unwrap();
    }

    fn add_concept(store: &GraphStore, label: &str, v: Vec<f32>) -> String {
        store
            .upsert_concept(label, &[], &unit(v), None, 0.99)
            .unwrap()
            .concept_id
    }

    #[test]
    fn test_axis_is_unit_norm_when_pairs_exist() {
        let (_dir, store, vocab, engine) = setup();
        embed_polar_vocab(&store, &vocab);

        let axis = engine.polarity_axis().unwrap().unwrap();
        let norm: f32 = axis.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        // Dominated by the first dimension by construction
        assert!(axis[0] > 0.95);
    }

    #[test]
    fn test_no_embedded_pairs_means_no_axis_and_zero_grounding() {
        let (_dir, store, _vocab, engine) = setup();
        assert!(engine.polarity_axis().unwrap().is_none());

        let c = add_concept(&store, "Alpha", vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(engine.grounding(&c).unwrap(), 0.0);
    }

    #[test]
    fn test_zero_incoming_edges_is_zero_grounding() {
        let (_dir, store, vocab, engine) = setup();
        embed_polar_vocab(&store, &vocab);
        let c = add_concept(&store, "Alpha", vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(engine.grounding(&c).unwrap(), 0.0);
    }

    #[test]
    fn test_grounding_is_continuous_not_binary() {
        let (_dir, store, vocab, engine) = setup();
        embed_polar_vocab(&store, &vocab);

        let target = add_concept(&store, "Claim", vec![0.0, 1.0, 0.0, 0.0]);
        let supporter = add_concept(&store, "Evidence", vec![0.0, 0.0, 0.0, 1.0]);
        let context = add_concept(&store, "System", vec![0.5, 0.5, 0.5, 0.0]);

        store.add_edge(&supporter, "SUPPORTS", &target, 1.0, None).unwrap();
        store.add_edge(&context, "PART_OF", &target, 1.0, None).unwrap();
        engine.invalidate_concept(&target);

        let axis = engine.polarity_axis().unwrap().unwrap();
        let snapshot = vocab.snapshot();
        let supports_proj = dot_product(snapshot.embedding_of("SUPPORTS").unwrap(), &axis);
        let part_of_proj = dot_product(snapshot.embedding_of("PART_OF").unwrap(), &axis);
        let expected = (supports_proj + part_of_proj) / 2.0;

        let grounding = engine.grounding(&target).unwrap();
        assert!((grounding - expected).abs() < 1e-5);
        // Between the pure-structural 0 and the pure-supportive projection
        assert!(grounding > 0.0 && grounding < supports_proj);
    }

    #[test]
    fn test_contradiction_pushes_grounding_negative() {
        let (_dir, store, vocab, engine) = setup();
        embed_polar_vocab(&store, &vocab);

        let target = add_concept(&store, "Claim", vec![0.0, 1.0, 0.0, 0.0]);
        let against = add_concept(&store, "Counter", vec![0.0, 0.0, 0.0, 1.0]);
        store
            .add_edge(&against, "CONTRADICTS", &target, 1.0, None)
            .unwrap();

        assert!(engine.grounding(&target).unwrap() < 0.0);
    }

    #[test]
    fn test_axis_cache_follows_vocab_generation() {
        let (_dir, store, vocab, engine) = setup();
        embed_polar_vocab(&store, &vocab);
        let before = engine.polarity_axis().unwrap().unwrap();

        // Flip the polarity vocabulary: axis must follow after reload
        for (positive, negative) in crate::config::default_polarity_pairs() {
            store
                .set_vocab_embedding(&positive, &unit(vec![-1.0, 0.2, 0.0, 0.0]), "m")
                .unwrap();
            store
                .set_vocab_embedding(&negative, &unit(vec![1.0, 0.2, 0.0, 0.0]), "m")
                .unwrap();
        }
        vocab.reload().unwrap();

        let after = engine.polarity_axis().unwrap().unwrap();
        assert!((before[0] + after[0]).abs() < 1e-4);
    }
}
