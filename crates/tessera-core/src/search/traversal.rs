//! Graph Traversal
//!
//! BFS utilities over the edge table: shortest path with automatic
//! segmentation of long paths, and depth-grouped neighborhood expansion
//! with the relationship sequence that reached each concept.
//!
//! Traversal is undirected (an edge connects its endpoints both ways);
//! reported hops keep the stored direction.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::GraphStore;

/// Maximum neighborhood depth
pub const MAX_DEPTH: usize = 5;

/// Hop length at which reported paths are segmented
pub const PATH_SEGMENT_HOPS: usize = 5;

/// One traversed edge with its stored direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathHop {
    pub src_concept_id: String,
    pub rel_type: String,
    pub dst_concept_id: String,
    pub confidence: f32,
}

/// A found path, segmented when longer than [`PATH_SEGMENT_HOPS`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub from: String,
    pub to: String,
    pub total_hops: usize,
    /// Hops grouped into segments of at most five
    pub segments: Vec<Vec<PathHop>>,
}

/// One reached concept in a neighborhood expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborhoodEntry {
    pub concept_id: String,
    /// Hops from the center
    pub distance: usize,
    /// Relationship types along the discovery path, center outward
    pub path_types: Vec<String>,
}

/// Depth-grouped neighborhood of a concept
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighborhood {
    pub center: String,
    /// `by_distance[0]` holds distance-1 entries, and so on
    pub by_distance: Vec<Vec<NeighborhoodEntry>>,
}

impl Neighborhood {
    /// All reached concept ids, nearest first
    pub fn concept_ids(&self) -> Vec<String> {
        self.by_distance
            .iter()
            .flatten()
            .map(|entry| entry.concept_id.clone())
            .collect()
    }
}

fn type_allowed(rel_type: &str, allowed: Option<&[String]>) -> bool {
    match allowed {
        Some(types) => types.iter().any(|t| t == rel_type),
        None => true,
    }
}

/// BFS shortest path between two concepts
///
/// Returns None when no path exists within `max_hops`. Paths longer than
/// five hops come back segmented.
pub fn shortest_path(
    store: &GraphStore,
    from: &str,
    to: &str,
    max_hops: usize,
    allowed_types: Option<&[String]>,
) -> Result<Option<PathResult>> {
    for id in [from, to] {
        if store.get_concept(id)?.is_none() {
            return Err(EngineError::NotFound(format!("concept {}", id)));
        }
    }
    if from == to {
        return Ok(Some(PathResult {
            from: from.to_string(),
            to: to.to_string(),
            total_hops: 0,
            segments: Vec::new(),
        }));
    }

    // parent: reached id -> hop that discovered it
    let mut parent: HashMap<String, PathHop> = HashMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(from.to_string());
    let mut frontier = VecDeque::from([from.to_string()]);
    let mut depth = 0usize;

    'search: while !frontier.is_empty() && depth < max_hops {
        depth += 1;
        let mut next = VecDeque::new();
        while let Some(current) = frontier.pop_front() {
            for edge in store.edges_for_concept(&current)? {
                if !type_allowed(&edge.rel_type, allowed_types) {
                    continue;
                }
                let neighbor = if edge.src_concept_id == current {
                    edge.dst_concept_id.clone()
                } else {
                    edge.src_concept_id.clone()
                };
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                parent.insert(
                    neighbor.clone(),
                    PathHop {
                        src_concept_id: edge.src_concept_id.clone(),
                        rel_type: edge.rel_type.clone(),
                        dst_concept_id: edge.dst_concept_id.clone(),
                        confidence: edge.confidence,
                    },
                );
                if neighbor == to {
                    break 'search;
                }
                next.push_back(neighbor);
            }
        }
        frontier = next;
    }

    if !parent.contains_key(to) {
        return Ok(None);
    }

    // Walk back from the target to the start
    let mut hops = Vec::new();
    let mut cursor = to.to_string();
    while cursor != from {
        let hop = parent
            .get(&cursor)
            .ok_or_else(|| EngineError::Internal("broken path backtrack".into()))?
            .clone();
        cursor = if hop.dst_concept_id == cursor {
            hop.src_concept_id.clone()
        } else {
            hop.dst_concept_id.clone()
        };
        hops.push(hop);
    }
    hops.reverse();

    let total_hops = hops.len();
    let segments: Vec<Vec<PathHop>> = hops
        .chunks(PATH_SEGMENT_HOPS)
        .map(|chunk| chunk.to_vec())
        .collect();

    Ok(Some(PathResult {
        from: from.to_string(),
        to: to.to_string(),
        total_hops,
        segments,
    }))
}

/// Depth-grouped neighborhood expansion from a center concept
///
/// Depth is capped at [`MAX_DEPTH`]. Each reached concept records the
/// relationship-type sequence of its discovery path.
pub fn neighborhood(
    store: &GraphStore,
    center: &str,
    depth: usize,
    allowed_types: Option<&[String]>,
) -> Result<Neighborhood> {
    if store.get_concept(center)?.is_none() {
        return Err(EngineError::NotFound(format!("concept {}", center)));
    }
    let depth = depth.min(MAX_DEPTH);

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(center.to_string());
    let mut frontier: Vec<(String, Vec<String>)> = vec![(center.to_string(), Vec::new())];
    let mut by_distance: Vec<Vec<NeighborhoodEntry>> = Vec::new();

    for distance in 1..=depth {
        let mut reached: Vec<NeighborhoodEntry> = Vec::new();
        let mut next_frontier: Vec<(String, Vec<String>)> = Vec::new();

        for (current, path_types) in &frontier {
            for edge in store.edges_for_concept(current)? {
                if !type_allowed(&edge.rel_type, allowed_types) {
                    continue;
                }
                let neighbor = if &edge.src_concept_id == current {
                    edge.dst_concept_id.clone()
                } else {
                    edge.src_concept_id.clone()
                };
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let mut types = path_types.clone();
                types.push(edge.rel_type.clone());
                reached.push(NeighborhoodEntry {
                    concept_id: neighbor.clone(),
                    distance,
                    path_types: types.clone(),
                });
                next_frontier.push((neighbor, types));
            }
        }

        if reached.is_empty() {
            break;
        }
        by_distance.push(reached);
        frontier = next_frontier;
    }

    Ok(Neighborhood {
        center: center.to_string(),
        by_distance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, Precision};
    use crate::embeddings::normalize_in_place;
    use crate::vocab::install_builtin_vocab;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<GraphStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = EmbeddingConfig {
            provider: "static-test".into(),
            model_name: "m".into(),
            dimension: 8,
            precision: Precision::Float32,
        };
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config).unwrap(),
        );
        install_builtin_vocab(&store).unwrap();
        (dir, store)
    }

    fn add_concept(store: &GraphStore, label: &str, axis: usize) -> String {
        let mut v = vec![0.01f32; 8];
        v[axis] = 1.0;
        normalize_in_place(&mut v);
        store
            .upsert_concept(label, &[], &v, None, 0.999)
            .unwrap()
            .concept_id
    }

    /// a -> b -> c -> d chain plus a shortcut a -> d
    fn chain(store: &GraphStore) -> Vec<String> {
        let ids: Vec<String> = (0..4)
            .map(|i| add_concept(store, &format!("Node {}", i), i))
            .collect();
        for pair in ids.windows(2) {
            store
                .add_edge(&pair[0], "RELATES_TO", &pair[1], 0.9, None)
                .unwrap();
        }
        ids
    }

    #[test]
    fn test_shortest_path_finds_chain() {
        let (_dir, store) = setup();
        let ids = chain(&store);

        let path = shortest_path(&store, &ids[0], &ids[3], 5, None)
            .unwrap()
            .unwrap();
        assert_eq!(path.total_hops, 3);
        assert_eq!(path.segments.len(), 1);
        assert_eq!(path.segments[0].len(), 3);
    }

    #[test]
    fn test_shortest_path_prefers_shortcut() {
        let (_dir, store) = setup();
        let ids = chain(&store);
        store
            .add_edge(&ids[0], "IMPLIES", &ids[3], 0.8, None)
            .unwrap();

        let path = shortest_path(&store, &ids[0], &ids[3], 5, None)
            .unwrap()
            .unwrap();
        assert_eq!(path.total_hops, 1);
        assert_eq!(path.segments[0][0].rel_type, "IMPLIES");
    }

    #[test]
    fn test_shortest_path_respects_type_filter_and_budget() {
        let (_dir, store) = setup();
        let ids = chain(&store);
        store
            .add_edge(&ids[0], "IMPLIES", &ids[3], 0.8, None)
            .unwrap();

        // Only RELATES_TO allowed: back to the 3-hop chain
        let allowed = vec!["RELATES_TO".to_string()];
        let path = shortest_path(&store, &ids[0], &ids[3], 5, Some(&allowed))
            .unwrap()
            .unwrap();
        assert_eq!(path.total_hops, 3);

        // Budget below the chain length: no path
        assert!(
            shortest_path(&store, &ids[0], &ids[3], 2, Some(&allowed))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_long_paths_are_segmented() {
        let (_dir, store) = setup();
        let ids: Vec<String> = (0..8)
            .map(|i| add_concept(&store, &format!("Long {}", i), i))
            .collect();
        for pair in ids.windows(2) {
            store
                .add_edge(&pair[0], "RELATES_TO", &pair[1], 0.9, None)
                .unwrap();
        }

        let path = shortest_path(&store, &ids[0], &ids[7], 10, None)
            .unwrap()
            .unwrap();
        assert_eq!(path.total_hops, 7);
        assert_eq!(path.segments.len(), 2);
        assert_eq!(path.segments[0].len(), 5);
        assert_eq!(path.segments[1].len(), 2);
    }

    #[test]
    fn test_same_endpoint_is_zero_hops() {
        let (_dir, store) = setup();
        let ids = chain(&store);
        let path = shortest_path(&store, &ids[0], &ids[0], 5, None)
            .unwrap()
            .unwrap();
        assert_eq!(path.total_hops, 0);
        assert!(path.segments.is_empty());
    }

    #[test]
    fn test_neighborhood_groups_by_distance() {
        let (_dir, store) = setup();
        let ids = chain(&store);

        let hood = neighborhood(&store, &ids[0], 2, None).unwrap();
        assert_eq!(hood.by_distance.len(), 2);
        assert_eq!(hood.by_distance[0].len(), 1);
        assert_eq!(hood.by_distance[0][0].concept_id, ids[1]);
        assert_eq!(hood.by_distance[1][0].concept_id, ids[2]);
        assert_eq!(
            hood.by_distance[1][0].path_types,
            vec!["RELATES_TO".to_string(), "RELATES_TO".to_string()]
        );
        assert_eq!(hood.concept_ids(), vec![ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_neighborhood_depth_is_capped() {
        let (_dir, store) = setup();
        let ids = chain(&store);
        let hood = neighborhood(&store, &ids[0], 50, None).unwrap();
        // Chain is only 3 long, but the cap itself must hold
        assert!(hood.by_distance.len() <= MAX_DEPTH);
    }

    #[test]
    fn test_missing_concept_is_not_found() {
        let (_dir, store) = setup();
        let ids = chain(&store);
        assert!(matches!(
            shortest_path(&store, &ids[0], "c_missing", 5, None),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            neighborhood(&store, "c_missing", 2, None),
            Err(EngineError::NotFound(_))
        ));
    }
}
