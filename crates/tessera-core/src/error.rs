//! Engine Error Taxonomy
//!
//! One error type for the whole engine. Every user-facing operation returns
//! `Result<T>` with a stable machine code (`code()`) and a human message;
//! internal library errors are wrapped, never leaked as-is.

use std::time::Duration;

/// Unified engine error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Entity does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Write conflicted with existing state
    #[error("conflict: {0}")]
    Conflict(String),
    /// Embedding dimension does not match the active configuration
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Relationship type is not registered or not active
    #[error("unknown vocabulary type: {0}")]
    UnknownVocabType(String),
    /// Embedding no longer matches its source content or dimension
    #[error("stale embedding: {0}")]
    Stale(String),
    /// Stored hash does not match recomputed content hash
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Provider could not be reached or returned a transient failure
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider rejected the configured credentials
    #[error("provider credentials invalid: {0}")]
    ProviderInvalid(String),
    /// Provider quota or rate limit exhausted
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Operation cancelled cooperatively
    #[error("cancelled")]
    Cancelled,
    /// Per-call or per-job time budget exceeded
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Anything else; the message is already user-safe
    #[error("internal error: {0}")]
    Internal(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable machine-readable code for the user-facing envelope
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::DimensionMismatch { .. } => "dimension_mismatch",
            EngineError::UnknownVocabType(_) => "unknown_vocab_type",
            EngineError::Stale(_) => "stale",
            EngineError::Integrity(_) => "integrity_error",
            EngineError::ProviderUnavailable(_) => "provider_unavailable",
            EngineError::ProviderInvalid(_) => "provider_invalid",
            EngineError::QuotaExceeded(_) => "quota_exceeded",
            EngineError::Cancelled => "cancelled",
            EngineError::Timeout(_) => "timeout",
            EngineError::Database(_) => "database",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether a job-level retry with backoff is worthwhile
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ProviderUnavailable(_) | EngineError::Timeout(_)
        )
    }

    /// Truncate a provider / driver message for persisted error columns
    pub fn truncated_message(&self, max_len: usize) -> String {
        let msg = self.to_string();
        if msg.len() <= max_len {
            msg
        } else {
            let mut end = max_len;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &msg[..end])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            EngineError::DimensionMismatch {
                expected: 768,
                actual: 256
            }
            .code(),
            "dimension_mismatch"
        );
        assert_eq!(EngineError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(EngineError::ProviderUnavailable("503".into()).is_retryable());
        assert!(EngineError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!EngineError::ProviderInvalid("bad key".into()).is_retryable());
        assert!(!EngineError::Integrity("hash".into()).is_retryable());
    }

    #[test]
    fn test_truncated_message() {
        let err = EngineError::Internal("a".repeat(500));
        let msg = err.truncated_message(64);
        assert!(msg.chars().count() <= 65);
        assert!(msg.ends_with('…'));
    }
}
