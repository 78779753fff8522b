//! HNSW Vector Index
//!
//! USearch-backed approximate nearest neighbor index, one instance per
//! embedding namespace (concepts, source chunks). Keys are entity id
//! strings mapped to internal u64 keys.
//!
//! Dimensions are fixed per instance and come from the active embedding
//! configuration; a dimension change rebuilds the index from stored blobs.

use std::collections::HashMap;
use std::path::Path;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::config::Precision;
use crate::error::{EngineError, Result};

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (higher = better recall, slower)
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions; must equal the active embedding dimension D
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
    /// Scalar storage precision
    pub precision: Precision,
}

impl VectorIndexConfig {
    /// Cosine-metric config for the given dimension
    pub fn for_dimension(dimensions: usize, precision: Precision) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            precision,
        }
    }

    fn options(&self) -> IndexOptions {
        IndexOptions {
            dimensions: self.dimensions,
            metric: MetricKind::Cos,
            quantization: match self.precision {
                Precision::Float32 => ScalarKind::F32,
                Precision::Float16 => ScalarKind::F16,
            },
            connectivity: self.connectivity,
            expansion_add: self.expansion_add,
            expansion_search: self.expansion_search,
            multi: false,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimensions: usize,
    pub connectivity: usize,
    pub memory_bytes: usize,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW vector index over one embedding namespace
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("config", &self.config)
            .field("key_to_id", &self.key_to_id)
            .field("id_to_key", &self.id_to_key)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl VectorIndex {
    /// Create an empty index for the given dimension
    pub fn new(dimensions: usize, precision: Precision) -> Result<Self> {
        Self::with_config(VectorIndexConfig::for_dimension(dimensions, precision))
    }

    /// Create an empty index with explicit configuration
    pub fn with_config(config: VectorIndexConfig) -> Result<Self> {
        let index = Index::new(&config.options())
            .map_err(|e| EngineError::Internal(format!("index creation failed: {}", e)))?;

        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index dimension
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Reserve capacity; usearch requires this before adds
    pub fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| EngineError::Internal(format!("index reserve failed: {}", e)))
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Add or replace a vector under a string key
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| EngineError::Internal(format!("index remove failed: {}", e)))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| EngineError::Internal(format!("index add failed: {}", e)))?;
            return Ok(());
        }

        // usearch segfaults on add without reserved capacity
        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.reserve(std::cmp::max(capacity * 2, 16))?;
        }

        let id = self.next_id;
        self.next_id += 1;

        self.index
            .add(id, vector)
            .map_err(|e| EngineError::Internal(format!("index add failed: {}", e)))?;

        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());

        Ok(())
    }

    /// Remove a vector by key; false when absent
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| EngineError::Internal(format!("index remove failed: {}", e)))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// k-nearest-neighbor search; returns (key, cosine similarity)
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        self.check_dimensions(query)?;

        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| EngineError::Internal(format!("index search failed: {}", e)))?;

        let mut matches = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(string_key) = self.id_to_key.get(key) {
                // Cosine distance to similarity
                matches.push((string_key.clone(), 1.0 - distance));
            }
        }

        Ok(matches)
    }

    /// kNN search filtered by minimum similarity
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>> {
        let results = self.search(query, limit)?;
        Ok(results
            .into_iter()
            .filter(|(_, score)| *score >= min_similarity)
            .collect())
    }

    /// Save index plus key mappings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| EngineError::Internal("invalid index path".to_string()))?;

        self.index
            .save(path_str)
            .map_err(|e| EngineError::Internal(format!("index save failed: {}", e)))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings = serde_json::json!({
            "dimensions": self.config.dimensions,
            "key_to_id": self.key_to_id,
            "next_id": self.next_id,
        });
        std::fs::write(&mappings_path, serde_json::to_string(&mappings)?)?;

        Ok(())
    }

    /// Load an index saved by [`VectorIndex::save`]
    ///
    /// Fails with `DimensionMismatch` when the saved dimension differs from
    /// the requested config; callers then rebuild from stored blobs.
    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| EngineError::Internal("invalid index path".to_string()))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&mappings_path)?)?;

        let saved_dimensions = mappings["dimensions"].as_u64().unwrap_or(0) as usize;
        if saved_dimensions != config.dimensions {
            return Err(EngineError::DimensionMismatch {
                expected: config.dimensions,
                actual: saved_dimensions,
            });
        }

        let index = Index::new(&config.options())
            .map_err(|e| EngineError::Internal(format!("index creation failed: {}", e)))?;
        index
            .load(path_str)
            .map_err(|e| EngineError::Internal(format!("index load failed: {}", e)))?;

        let key_to_id: HashMap<String, u64> =
            serde_json::from_value(mappings["key_to_id"].clone())?;
        let next_id = mappings["next_id"]
            .as_u64()
            .ok_or_else(|| EngineError::Internal("invalid next_id in index mappings".to_string()))?;
        let id_to_key: HashMap<u64, String> =
            key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();

        Ok(Self {
            index,
            config,
            key_to_id,
            id_to_key,
            next_id,
        })
    }

    /// Index statistics
    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
            connectivity: self.config.connectivity,
            memory_bytes: self.index.serialized_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    #[test]
    fn test_add_and_search() {
        let mut index = VectorIndex::new(4, Precision::Float32).unwrap();
        index.add("a", &unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        index.add("b", &unit(vec![0.0, 1.0, 0.0, 0.0])).unwrap();
        index.add("c", &unit(vec![0.9, 0.1, 0.0, 0.0])).unwrap();

        let results = index
            .search(&unit(vec![1.0, 0.0, 0.0, 0.0]), 2)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "c");
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn test_threshold_filters_and_empty_is_ok() {
        let mut index = VectorIndex::new(4, Precision::Float32).unwrap();
        assert!(index
            .search_with_threshold(&[1.0, 0.0, 0.0, 0.0], 5, 0.5)
            .unwrap()
            .is_empty());

        index.add("a", &unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        index.add("b", &unit(vec![0.0, 1.0, 0.0, 0.0])).unwrap();

        let results = index
            .search_with_threshold(&unit(vec![1.0, 0.0, 0.0, 0.0]), 5, 0.5)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(4, Precision::Float32).unwrap();
        let err = index.add("a", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let mut index = VectorIndex::new(4, Precision::Float32).unwrap();
        index.add("a", &unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        index.add("a", &unit(vec![0.0, 1.0, 0.0, 0.0])).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&unit(vec![0.0, 1.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concepts.usearch");

        let mut index = VectorIndex::new(4, Precision::Float32).unwrap();
        index.add("a", &unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        index.add("b", &unit(vec![0.0, 1.0, 0.0, 0.0])).unwrap();
        index.save(&path).unwrap();

        let loaded =
            VectorIndex::load(&path, VectorIndexConfig::for_dimension(4, Precision::Float32))
                .unwrap();
        assert_eq!(loaded.len(), 2);
        let results = loaded.search(&unit(vec![1.0, 0.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(results[0].0, "a");

        // A dimension change refuses the stale file
        let err = VectorIndex::load(
            &path,
            VectorIndexConfig::for_dimension(8, Precision::Float32),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }
}
