//! Deterministic in-process providers for tests
//!
//! No randomness: embedding vectors are derived from a SHA-256 of the text,
//! so similarity relationships are stable across runs, and explicit vector
//! overrides let tests script exact similarities.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::providers::{
    BlockKind, ConceptProposal, Decision, DecisionContext, EmbeddingOutput, EmbeddingProvider,
    ExtractionResult, ProviderCapability, ReasoningProvider, RelationshipProposal,
};

/// Deterministic embedding provider for tests
pub struct StaticEmbeddingProvider {
    dimension: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl StaticEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Pin an exact vector for a given text
    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        self.overrides
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }

    /// Hash-derived unit vector for a text
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.overrides.lock().unwrap().get(text) {
            return v.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let byte = digest[i % digest.len()];
                // Spread bytes into [-1, 1], perturbed by position so the
                // vector is not periodic in the digest length
                (byte as f32 / 127.5 - 1.0) + (i as f32 * 0.01).sin() * 0.1
            })
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for StaticEmbeddingProvider {
    fn name(&self) -> &str {
        "static-test"
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingOutput> {
        if text.trim().is_empty() {
            return Err(EngineError::Internal("empty text".into()));
        }
        Ok(EmbeddingOutput {
            vector: self.vector_for(text),
            model: "static-test-model".to_string(),
            dimension: self.dimension,
        })
    }
}

/// Scripted reasoning provider for tests
///
/// Extraction results and decisions are popped from queues; when a queue is
/// empty the provider returns an empty extraction / "skip" decision.
pub struct ScriptedReasoningProvider {
    extractions: Mutex<VecDeque<ExtractionResult>>,
    decisions: Mutex<VecDeque<Decision>>,
    pub decide_calls: Mutex<Vec<DecisionContext>>,
}

impl ScriptedReasoningProvider {
    pub fn new() -> Self {
        Self {
            extractions: Mutex::new(VecDeque::new()),
            decisions: Mutex::new(VecDeque::new()),
            decide_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_extraction(&self, result: ExtractionResult) {
        self.extractions.lock().unwrap().push_back(result);
    }

    pub fn push_decision(&self, action: &str, rationale: &str) {
        self.decisions.lock().unwrap().push_back(Decision {
            action: action.to_string(),
            rationale: rationale.to_string(),
        });
    }
}

impl Default for ScriptedReasoningProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoningProvider {
    fn name(&self) -> &str {
        "scripted-test"
    }

    fn capabilities(&self) -> &[ProviderCapability] {
        &[ProviderCapability::Extract, ProviderCapability::Decide]
    }

    async fn extract(
        &self,
        _text: &str,
        _known_concepts: &[String],
        _known_types: &[String],
    ) -> Result<ExtractionResult> {
        Ok(self
            .extractions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn decide(&self, context: &DecisionContext) -> Result<Decision> {
        self.decide_calls.lock().unwrap().push(context.clone());
        Ok(self.decisions.lock().unwrap().pop_front().unwrap_or(Decision {
            action: "skip".to_string(),
            rationale: "no scripted decision".to_string(),
        }))
    }

    async fn describe(&self, block: &str, kind: &BlockKind) -> Result<String> {
        let label = match kind {
            BlockKind::Code { language } => {
                format!("code ({})", language.as_deref().unwrap_or("unknown"))
            }
            BlockKind::Diagram => "diagram".to_string(),
        };
        Ok(format!(
            "Prose description of {} block, {} bytes.",
            label,
            block.len()
        ))
    }
}

/// Convenience constructors for extraction fixtures
pub fn concept(label: &str, quote: &str) -> ConceptProposal {
    ConceptProposal {
        label: label.to_string(),
        search_terms: vec![label.to_lowercase()],
        quote: quote.to_string(),
    }
}

pub fn relationship(src: &str, rel_type: &str, dst: &str, confidence: f32) -> RelationshipProposal {
    RelationshipProposal {
        src_label: src.to_string(),
        rel_type: rel_type.to_string(),
        dst_label: dst.to_string(),
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_embeddings_are_deterministic() {
        let provider = StaticEmbeddingProvider::new(64);
        let a = provider.embed("recursion").await.unwrap();
        let b = provider.embed("recursion").await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert_eq!(a.dimension, 64);

        let norm = a.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_vector_override() {
        let provider = StaticEmbeddingProvider::new(3);
        provider.set_vector("up", vec![0.0, 1.0, 0.0]);
        let out = provider.embed("up").await.unwrap();
        assert_eq!(out.vector, vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_scripted_decisions_default_to_skip() {
        let provider = ScriptedReasoningProvider::new();
        let ctx = DecisionContext {
            subject: "merge A into B".into(),
            action_space: vec!["merge".into(), "skip".into()],
            scores: serde_json::json!({"similarity": 0.8}),
            summary: "candidates".into(),
        };
        let decision = provider.decide(&ctx).await.unwrap();
        assert_eq!(decision.action, "skip");
        assert_eq!(provider.decide_calls.lock().unwrap().len(), 1);
    }
}
