//! Embeddings
//!
//! Shared vector type, byte codec and similarity math, plus the unified
//! embedding service that keeps the concept, source-chunk and vocabulary
//! namespaces covered under the active model.

pub mod chunking;
pub mod device;
mod service;

pub use service::{
    ChunkFreshness, CoverageReport, EmbeddingService, NamespaceCoverage, RegenReport, RegenScope,
};

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A semantic embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Dimensions of the vector
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Create a unit-normalized embedding from a raw vector
    pub fn unit(mut vector: Vec<f32>) -> Self {
        normalize_in_place(&mut vector);
        Self::new(vector)
    }

    /// Compute cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.dimensions != other.dimensions {
            return 0.0;
        }
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Normalize the vector to unit length in place
    pub fn normalize(&mut self) {
        normalize_in_place(&mut self.vector);
    }

    /// Check whether the vector has unit length
    pub fn is_normalized(&self) -> bool {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        (norm - 1.0).abs() < 1e-3
    }

    /// Convert to little-endian bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Create from bytes written by [`Embedding::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Cosine similarity between two vectors; 0.0 on length mismatch
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Dot product; 0.0 on length mismatch
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Normalize a vector to unit length in place; zero vectors stay zero
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Euclidean norm of a vector
pub fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Element-wise difference `a - b`; empty on length mismatch
pub fn difference(a: &[f32], b: &[f32]) -> Vec<f32> {
    if a.len() != b.len() {
        return Vec::new();
    }
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_byte_round_trip() {
        let original = Embedding::new(vec![0.25, -1.5, 3.75, 0.0]);
        let bytes = original.to_bytes();
        let restored = Embedding::from_bytes(&bytes).unwrap();
        assert_eq!(restored, original);
        assert!(Embedding::from_bytes(&bytes[..3]).is_none());
    }

    #[test]
    fn test_unit_normalization() {
        let emb = Embedding::unit(vec![3.0, 4.0]);
        assert!(emb.is_normalized());
        assert!((emb.vector[0] - 0.6).abs() < 1e-6);
        assert!((emb.vector[1] - 0.8).abs() < 1e-6);

        // Zero vector stays zero rather than dividing by zero
        let zero = Embedding::unit(vec![0.0, 0.0]);
        assert_eq!(zero.vector, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        // Length mismatch is defined as zero, not a panic
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_difference_and_norm() {
        let d = difference(&[1.0, 2.0], &[0.5, 0.5]);
        assert_eq!(d, vec![0.5, 1.5]);
        assert!((norm(&[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert!(difference(&[1.0], &[1.0, 2.0]).is_empty());
    }
}
