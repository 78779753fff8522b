//! Provider Interfaces
//!
//! External language-model and embedding backends, injected at process
//! start. The engine never depends on a specific vendor: providers are
//! trait objects advertising a capability set, and every call site goes
//! through the shared retry/timeout policy.

#[cfg(feature = "local-embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "local-embeddings")))]
pub mod local;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ============================================================================
// CAPABILITIES
// ============================================================================

/// What a provider implementation can do
///
/// The orchestrator composes providers by capability; a reasoning provider
/// may delegate `Embed` to a local backend.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCapability {
    /// Text to fixed-dimension vector
    Embed,
    /// Concept / relationship extraction from text
    Extract,
    /// Structured decisions from numeric context
    Decide,
}

impl ProviderCapability {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCapability::Embed => "embed",
            ProviderCapability::Extract => "extract",
            ProviderCapability::Decide => "decide",
        }
    }
}

impl std::fmt::Display for ProviderCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EMBEDDING PROVIDER
// ============================================================================

/// A single embedded text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingOutput {
    /// The raw vector; the embedding service normalizes before use
    pub vector: Vec<f32>,
    /// Model identifier the provider used
    pub model: String,
    /// Vector dimension as reported by the provider
    pub dimension: usize,
}

/// Embedding backend
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider identifier, e.g. "local" or "openai"
    fn name(&self) -> &str;

    /// Capabilities this implementation advertises
    fn capabilities(&self) -> &[ProviderCapability] {
        &[ProviderCapability::Embed]
    }

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<EmbeddingOutput>;

    /// Embed a batch of texts
    ///
    /// The default calls [`EmbeddingProvider::embed`] sequentially; backends
    /// with native batching should override.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutput>> {
        let mut outputs = Vec::with_capacity(texts.len());
        for text in texts {
            outputs.push(self.embed(text).await?);
        }
        Ok(outputs)
    }

    /// Minimal call used to validate stored credentials at startup
    async fn validate(&self) -> Result<()> {
        self.embed("ping").await.map(|_| ())
    }
}

// ============================================================================
// REASONING PROVIDER
// ============================================================================

/// A concept proposed by extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptProposal {
    /// Short canonical label
    pub label: String,
    /// Alias strings for later retrieval
    pub search_terms: Vec<String>,
    /// Verbatim supporting quote from the chunk
    pub quote: String,
}

/// A typed relationship proposed by extraction
///
/// Endpoints are labels; the pipeline resolves them against proposed and
/// existing concepts before writing edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipProposal {
    pub src_label: String,
    /// Uppercase relationship type name
    pub rel_type: String,
    pub dst_label: String,
    /// Extraction confidence in [0, 1]
    pub confidence: f32,
}

/// Result of one extraction call over a chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub concepts: Vec<ConceptProposal>,
    pub relationships: Vec<RelationshipProposal>,
    /// Relationship type names the provider used that the caller's known set
    /// does not contain
    pub skipped_types: Vec<String>,
}

/// Numeric context for a provider decision
///
/// Decisions are never requested without numbers: similarity, usage and
/// edge counts come first, prose second.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    /// What is being decided, e.g. "merge ENABLES into FACILITATES"
    pub subject: String,
    /// Allowed actions; the provider must answer with one of these
    pub action_space: Vec<String>,
    /// Structured numeric scores backing the decision
    pub scores: serde_json::Value,
    /// Short prose summary of the situation
    pub summary: String,
}

/// A typed provider decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// One of the offered actions
    pub action: String,
    pub rationale: String,
}

/// Kind of a non-prose markdown block handed to [`ReasoningProvider::describe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Fenced code block with an optional language tag
    Code { language: Option<String> },
    /// Diagram notation (mermaid, graphviz and similar)
    Diagram,
}

/// Reasoning backend used for extraction, curation decisions and
/// code-block prose during preprocessing
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Provider identifier
    fn name(&self) -> &str;

    /// Capabilities this implementation advertises
    fn capabilities(&self) -> &[ProviderCapability];

    /// Extract concept and relationship proposals from a chunk
    ///
    /// `known_concepts` lets the provider link against already-stored labels;
    /// `known_types` is the active vocabulary the caller will accept.
    async fn extract(
        &self,
        text: &str,
        known_concepts: &[String],
        known_types: &[String],
    ) -> Result<ExtractionResult>;

    /// Make a typed decision from structured numeric context
    async fn decide(&self, context: &DecisionContext) -> Result<Decision>;

    /// Produce a prose description of a code or diagram block
    async fn describe(&self, block: &str, kind: &BlockKind) -> Result<String>;

    /// Minimal call used to validate stored credentials at startup
    async fn validate(&self) -> Result<()> {
        let context = DecisionContext {
            subject: "connectivity check".to_string(),
            action_space: vec!["ok".to_string()],
            scores: serde_json::json!({}),
            summary: "reply with ok".to_string(),
        };
        self.decide(&context).await.map(|_| ())
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Retry/backoff policy applied to every provider call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt
    pub base_delay: Duration,
    /// Per-call timeout
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Run a provider call under the retry policy
///
/// Retries only [`EngineError::is_retryable`] failures (unavailable,
/// timeout); credential and quota errors surface immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(policy.call_timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    op,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "provider call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result = with_retries(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::ProviderUnavailable("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<u32> = with_retries(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::ProviderUnavailable("503".into())) }
        })
        .await;

        assert!(matches!(result, Err(EngineError::ProviderUnavailable(_))));
        // First attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_credential_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result: Result<u32> = with_retries(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::ProviderInvalid("bad key".into())) }
        })
        .await;

        assert!(matches!(result, Err(EngineError::ProviderInvalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
