//! Configuration & Runtime Registry
//!
//! Process-wide read-mostly registry for the active embedding backend, the
//! active reasoning backend and engine settings. Updated only through
//! explicit swap operations; each swap bumps a generation counter that
//! dependent caches (vector indexes, polarity axis) check before reuse.
//!
//! Mode gating: with `development_mode` set, configuration is read from the
//! environment; otherwise from the store. There is no silent environment
//! fallback in production.

pub mod secrets;

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::providers::ProviderCapability;

// ============================================================================
// EMBEDDING CONFIG
// ============================================================================

/// Storage precision for embedding vectors
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float16,
}

impl Precision {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float32 => "float32",
            Precision::Float16 => "float16",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" => Ok(Precision::Float32),
            "float16" | "f16" => Ok(Precision::Float16),
            _ => Err(format!("Unknown precision: {}", s)),
        }
    }
}

/// Active embedding backend selection
///
/// `dimension` is the system-wide invariant D: every concept, source chunk
/// and vocabulary embedding must match it or is treated as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model_name: String,
    pub dimension: usize,
    pub precision: Precision,
}

impl EmbeddingConfig {
    /// Read from `TESSERA_EMBEDDING_*` environment variables
    ///
    /// All of provider, model and dimension must be present; partial
    /// configuration is an error, not a fallback.
    pub fn from_env() -> Result<Self> {
        let provider = require_env("TESSERA_EMBEDDING_PROVIDER")?;
        let model_name = require_env("TESSERA_EMBEDDING_MODEL")?;
        let dimension: usize = require_env("TESSERA_EMBEDDING_DIMENSION")?
            .parse()
            .map_err(|e| {
                EngineError::Internal(format!("TESSERA_EMBEDDING_DIMENSION invalid: {}", e))
            })?;
        let precision = std::env::var("TESSERA_EMBEDDING_PRECISION")
            .ok()
            .map(|s| s.parse())
            .transpose()
            .map_err(EngineError::Internal)?
            .unwrap_or_default();
        Ok(Self {
            provider,
            model_name,
            dimension,
            precision,
        })
    }
}

// ============================================================================
// AI PROVIDER CONFIG
// ============================================================================

/// Active reasoning backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiProviderConfig {
    pub provider: String,
    pub model_name: String,
    pub capabilities: Vec<ProviderCapability>,
}

impl AiProviderConfig {
    /// Read from `TESSERA_AI_*` environment variables
    pub fn from_env() -> Result<Self> {
        let provider = require_env("TESSERA_AI_PROVIDER")?;
        let model_name = require_env("TESSERA_AI_MODEL")?;
        Ok(Self {
            provider,
            model_name,
            capabilities: vec![ProviderCapability::Extract, ProviderCapability::Decide],
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| EngineError::Internal(format!("{} not set in development mode", key)))
}

// ============================================================================
// ENGINE SETTINGS
// ============================================================================

/// Annealing automation level
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutomationLevel {
    /// Proposals auto-approved and executed within the cycle
    Autonomous,
    /// Proposals wait for external approval
    #[default]
    Hitl,
}

impl std::str::FromStr for AutomationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autonomous" => Ok(AutomationLevel::Autonomous),
            "hitl" => Ok(AutomationLevel::Hitl),
            _ => Err(format!("Unknown automation level: {}", s)),
        }
    }
}

/// Tunable engine behavior, one field per configuration key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Target ingestion chunk size in words
    pub ingest_target_words: usize,
    /// Overlap between consecutive ingestion chunks in words
    pub ingest_overlap_words: usize,
    /// Skip the approval gate entirely
    pub ingest_auto_approve: bool,
    /// Chunk-count estimate above which a job needs approval
    pub approval_chunk_threshold: usize,
    /// Concept dedup threshold τ_merge
    pub merge_similarity_threshold: f32,
    /// Minimum similarity for search results; independent of τ_merge
    pub search_min_similarity: f32,
    /// Ordered (positive, negative) vocabulary pairs for the default axis
    pub polarity_pairs: Vec<(String, String)>,
    /// Runner-up category score that flags a type as ambiguous
    pub category_ambiguity_threshold: f64,
    /// Edges sampled per type for role measurement
    pub role_sample_size: usize,
    /// Vocabulary-affecting events before roles are re-measured
    pub role_remeasure_threshold: i64,
    /// Active-size target for vocabulary consolidation
    pub consolidate_target: usize,
    /// (floor, ceiling) of the inactive-ratio hysteresis band
    pub consolidate_hysteresis: (f64, f64),
    /// Epoch delta between annealing cycles
    pub annealing_interval_epochs: i64,
    pub annealing_automation: AutomationLevel,
    /// Candidates evaluated per annealing cycle
    pub annealing_max_proposals: usize,
    /// Advisory lock key for scheduler leader election
    pub scheduler_advisory_lock_key: String,
    /// Free accelerator memory required to avoid CPU fallback, in bytes
    pub min_free_device_memory: u64,
    /// Read configuration from the environment instead of the store
    pub development_mode: bool,
    /// Per-call provider timeout
    pub provider_call_timeout: Duration,
    /// Per-job wall-clock budget
    pub job_timeout: Duration,
    /// Bounded parallelism for code-block prose translation
    pub preprocess_permits: usize,
    /// Worker threads consuming the job queue
    pub ingest_workers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ingest_target_words: 1000,
            ingest_overlap_words: 200,
            ingest_auto_approve: false,
            approval_chunk_threshold: 25,
            merge_similarity_threshold: 0.70,
            search_min_similarity: 0.75,
            polarity_pairs: default_polarity_pairs(),
            category_ambiguity_threshold: 0.70,
            role_sample_size: 100,
            role_remeasure_threshold: 10,
            consolidate_target: 30,
            consolidate_hysteresis: (0.10, 0.20),
            annealing_interval_epochs: 5,
            annealing_automation: AutomationLevel::Hitl,
            annealing_max_proposals: 10,
            scheduler_advisory_lock_key: "tessera.scheduler".to_string(),
            min_free_device_memory: 500 * 1024 * 1024,
            development_mode: false,
            provider_call_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(30 * 60),
            preprocess_permits: 3,
            ingest_workers: 2,
        }
    }
}

/// The five default polarity pairs, positive pole first
pub fn default_polarity_pairs() -> Vec<(String, String)> {
    [
        ("SUPPORTS", "CONTRADICTS"),
        ("VALIDATES", "REFUTES"),
        ("CONFIRMS", "DISPROVES"),
        ("REINFORCES", "OPPOSES"),
        ("ENABLES", "PREVENTS"),
    ]
    .into_iter()
    .map(|(p, n)| (p.to_string(), n.to_string()))
    .collect()
}

// ============================================================================
// RUNTIME REGISTRY
// ============================================================================

/// Process-wide registry of active configuration
///
/// Readers take cheap clone snapshots; writers swap whole values and bump
/// the generation so dependent caches can tell they are stale.
pub struct ConfigRegistry {
    embedding: RwLock<EmbeddingConfig>,
    ai: RwLock<AiProviderConfig>,
    settings: RwLock<EngineSettings>,
    embedding_generation: AtomicU64,
}

impl ConfigRegistry {
    pub fn new(
        embedding: EmbeddingConfig,
        ai: AiProviderConfig,
        settings: EngineSettings,
    ) -> Self {
        Self {
            embedding: RwLock::new(embedding),
            ai: RwLock::new(ai),
            settings: RwLock::new(settings),
            embedding_generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the active embedding configuration
    pub fn embedding(&self) -> EmbeddingConfig {
        self.embedding.read().expect("config lock poisoned").clone()
    }

    /// The system-wide embedding dimension D
    pub fn dimension(&self) -> usize {
        self.embedding.read().expect("config lock poisoned").dimension
    }

    /// Snapshot of the active reasoning configuration
    pub fn ai(&self) -> AiProviderConfig {
        self.ai.read().expect("config lock poisoned").clone()
    }

    /// Snapshot of engine settings
    pub fn settings(&self) -> EngineSettings {
        self.settings.read().expect("config lock poisoned").clone()
    }

    /// Generation of the embedding configuration; bumps on every swap
    pub fn embedding_generation(&self) -> u64 {
        self.embedding_generation.load(Ordering::Acquire)
    }

    /// Swap the active embedding configuration
    ///
    /// Returns the new generation. Callers owning persisted state must
    /// enqueue a full regeneration when the dimension changed.
    pub fn swap_embedding(&self, config: EmbeddingConfig) -> u64 {
        {
            let mut guard = self.embedding.write().expect("config lock poisoned");
            *guard = config;
        }
        self.embedding_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Swap the active reasoning configuration
    pub fn swap_ai(&self, config: AiProviderConfig) {
        let mut guard = self.ai.write().expect("config lock poisoned");
        *guard = config;
    }

    /// Replace engine settings
    pub fn update_settings(&self, settings: EngineSettings) {
        let mut guard = self.settings.write().expect("config lock poisoned");
        *guard = settings;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ConfigRegistry {
        ConfigRegistry::new(
            EmbeddingConfig {
                provider: "static-test".into(),
                model_name: "static-test-model".into(),
                dimension: 64,
                precision: Precision::Float32,
            },
            AiProviderConfig {
                provider: "scripted-test".into(),
                model_name: "scripted".into(),
                capabilities: vec![ProviderCapability::Extract, ProviderCapability::Decide],
            },
            EngineSettings::default(),
        )
    }

    #[test]
    fn test_swap_bumps_generation() {
        let registry = test_registry();
        assert_eq!(registry.embedding_generation(), 0);
        assert_eq!(registry.dimension(), 64);

        let mut config = registry.embedding();
        config.dimension = 128;
        let generation = registry.swap_embedding(config);
        assert_eq!(generation, 1);
        assert_eq!(registry.embedding_generation(), 1);
        assert_eq!(registry.dimension(), 128);
    }

    #[test]
    fn test_default_settings_match_documented_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.ingest_target_words, 1000);
        assert_eq!(settings.ingest_overlap_words, 200);
        assert!((settings.merge_similarity_threshold - 0.70).abs() < f32::EPSILON);
        assert!((settings.search_min_similarity - 0.75).abs() < f32::EPSILON);
        assert_eq!(settings.polarity_pairs.len(), 5);
        assert_eq!(settings.consolidate_hysteresis, (0.10, 0.20));
        assert_eq!(settings.annealing_interval_epochs, 5);
        assert_eq!(settings.role_sample_size, 100);
        assert_eq!(settings.min_free_device_memory, 500 * 1024 * 1024);
    }

    #[test]
    fn test_polarity_pairs_positive_first() {
        let pairs = default_polarity_pairs();
        assert_eq!(pairs[0], ("SUPPORTS".to_string(), "CONTRADICTS".to_string()));
        assert_eq!(pairs[4], ("ENABLES".to_string(), "PREVENTS".to_string()));
    }
}
