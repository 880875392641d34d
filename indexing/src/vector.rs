//! Vector index: HNSW approximate nearest-neighbor search.
//!
//! The authoritative copy of every vector lives in the storage-owned
//! `embeddings` table; the HNSW graph here is an in-memory acceleration
//! structure rebuilt from that table at startup and kept current by
//! post-commit inserts. Deletions tombstone; a rebuild reclaims them.
//!
//! Writers serialize on an internal lock; searches take the shared side.
//! One index exists per (environment, resolution) pair so 384-d and 1536-d
//! vectors never mix.

use common::models::Resolution;
use common::{DbError, DbResult, EmbeddingId};
use hashbrown::HashMap;
use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use std::collections::HashSet;

use crate::config::HnswConfig;

/// A single vector search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    /// Id of the matching embedding.
    pub id: EmbeddingId,
    /// Cosine distance to the query (lower is closer).
    pub distance: f32,
}

impl SearchResult {
    /// Similarity in [0, 1]-ish space (1 - cosine distance).
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

struct HnswState {
    hnsw: Hnsw<'static, f32, DistCosine>,
    key_to_id: HashMap<usize, EmbeddingId>,
    id_to_key: HashMap<EmbeddingId, usize>,
    tombstones: HashSet<usize>,
    next_key: usize,
}

impl HnswState {
    fn new(config: &HnswConfig) -> Self {
        let hnsw = Hnsw::<f32, DistCosine>::new(
            config.max_connections,
            config.initial_capacity,
            config.num_layers(),
            config.ef_construction,
            DistCosine,
        );
        Self {
            hnsw,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            tombstones: HashSet::new(),
            next_key: 0,
        }
    }

    fn insert(&mut self, id: &EmbeddingId, vector: &[f32]) {
        // Upsert: the old point stays in the graph but stops matching.
        if let Some(old_key) = self.id_to_key.get(id).copied() {
            self.tombstones.insert(old_key);
            self.key_to_id.remove(&old_key);
        }

        let key = self.next_key;
        self.next_key += 1;
        self.hnsw.insert((vector, key));
        self.key_to_id.insert(key, id.clone());
        self.id_to_key.insert(id.clone(), key);
    }

    fn remove(&mut self, id: &EmbeddingId) -> bool {
        if let Some(key) = self.id_to_key.remove(id) {
            self.key_to_id.remove(&key);
            self.tombstones.insert(key);
            true
        } else {
            false
        }
    }

    fn live_len(&self) -> usize {
        self.id_to_key.len()
    }
}

/// In-memory HNSW index over one resolution class.
pub struct VectorIndex {
    resolution: Resolution,
    config: HnswConfig,
    state: RwLock<HnswState>,
}

impl VectorIndex {
    /// Creates an empty index for the given resolution.
    pub fn new(resolution: Resolution, config: HnswConfig) -> Self {
        Self {
            resolution,
            config,
            state: RwLock::new(HnswState::new(&config)),
        }
    }

    /// The resolution class this index serves.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Inserts or replaces a vector.
    ///
    /// # Errors
    ///
    /// `Invalid` if the vector dimension does not match the resolution.
    pub fn insert(&self, id: &EmbeddingId, vector: &[f32]) -> DbResult<()> {
        if vector.len() != self.resolution.dim() {
            return Err(DbError::Invalid(format!(
                "dimension mismatch: expected {}, got {}",
                self.resolution.dim(),
                vector.len()
            )));
        }
        self.state.write().insert(id, vector);
        Ok(())
    }

    /// Tombstones a vector. Returns whether it was present.
    pub fn remove(&self, id: &EmbeddingId) -> bool {
        self.state.write().remove(id)
    }

    /// Number of live (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        self.state.read().live_len()
    }

    /// Whether the index holds no live vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k nearest neighbors of `query`.
    ///
    /// Search skips tombstones; `ef_search` controls query-time breadth.
    /// With k >= N every live vector is returned.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> DbResult<Vec<SearchResult>> {
        if query.len() != self.resolution.dim() {
            return Err(DbError::Invalid(format!(
                "query dimension mismatch: expected {}, got {}",
                self.resolution.dim(),
                query.len()
            )));
        }
        let state = self.state.read();
        if state.live_len() == 0 || k == 0 {
            return Ok(Vec::new());
        }

        // Oversample by the tombstone count so dead points cannot crowd out
        // live ones.
        let fetch = (k + state.tombstones.len()).min(state.next_key);
        let ef = ef_search.max(fetch);
        let neighbours = state.hnsw.search(query, fetch, ef);

        let mut results = Vec::with_capacity(k);
        for neighbour in neighbours {
            if state.tombstones.contains(&neighbour.d_id) {
                continue;
            }
            if let Some(id) = state.key_to_id.get(&neighbour.d_id) {
                results.push(SearchResult {
                    id: id.clone(),
                    distance: neighbour.distance,
                });
                if results.len() >= k {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Discards the graph and rebuilds it from `entries`, reclaiming
    /// tombstones.
    pub fn rebuild<I>(&self, entries: I) -> DbResult<usize>
    where
        I: IntoIterator<Item = (EmbeddingId, Vec<f32>)>,
    {
        let mut fresh = HnswState::new(&self.config);
        let mut count = 0;
        for (id, vector) in entries {
            if vector.len() != self.resolution.dim() {
                log::warn!(
                    "skipping vector {} during rebuild: dimension {} != {}",
                    id,
                    vector.len(),
                    self.resolution.dim()
                );
                continue;
            }
            fresh.insert(&id, &vector);
            count += 1;
        }
        *self.state.write() = fresh;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    fn small_config() -> HnswConfig {
        HnswConfig {
            initial_capacity: 1_000,
            ..HnswConfig::default()
        }
    }

    #[test]
    fn test_insert_and_search() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());

        index.insert(&EmbeddingId::new("a"), &unit(384, 0)).unwrap();
        index.insert(&EmbeddingId::new("b"), &unit(384, 1)).unwrap();
        index.insert(&EmbeddingId::new("c"), &unit(384, 2)).unwrap();

        let results = index.search(&unit(384, 1), 1, 50).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id.as_str(), "b");
        assert!(results[0].distance < 0.01);
    }

    #[test]
    fn test_k_exceeding_len_returns_all() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());
        index.insert(&EmbeddingId::new("a"), &unit(384, 0)).unwrap();
        index.insert(&EmbeddingId::new("b"), &unit(384, 1)).unwrap();

        let results = index.search(&unit(384, 0), 10, 50).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());
        let err = index.insert(&EmbeddingId::new("bad"), &[0.5; 10]);
        assert!(matches!(err, Err(DbError::Invalid(_))));

        let err = index.search(&[0.5; 10], 5, 50);
        assert!(matches!(err, Err(DbError::Invalid(_))));
    }

    #[test]
    fn test_remove_tombstones_point() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());
        index.insert(&EmbeddingId::new("a"), &unit(384, 0)).unwrap();
        index.insert(&EmbeddingId::new("b"), &unit(384, 1)).unwrap();

        assert!(index.remove(&EmbeddingId::new("a")));
        assert!(!index.remove(&EmbeddingId::new("a")));
        assert_eq!(index.len(), 1);

        let results = index.search(&unit(384, 0), 2, 50).unwrap();
        assert!(results.iter().all(|r| r.id.as_str() != "a"));
    }

    #[test]
    fn test_upsert_replaces_vector() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());
        let id = EmbeddingId::new("a");
        index.insert(&id, &unit(384, 0)).unwrap();
        index.insert(&id, &unit(384, 5)).unwrap();

        assert_eq!(index.len(), 1);
        let results = index.search(&unit(384, 5), 1, 50).unwrap();
        assert_eq!(results[0].id.as_str(), "a");
        assert!(results[0].distance < 0.01);
    }

    #[test]
    fn test_rebuild_reclaims_tombstones() {
        let index = VectorIndex::new(Resolution::Fast384, small_config());
        index.insert(&EmbeddingId::new("a"), &unit(384, 0)).unwrap();
        index.insert(&EmbeddingId::new("b"), &unit(384, 1)).unwrap();
        index.remove(&EmbeddingId::new("b"));

        let count = index
            .rebuild(vec![(EmbeddingId::new("a"), unit(384, 0))])
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.len(), 1);

        let results = index.search(&unit(384, 0), 5, 50).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id.as_str(), "a");
    }
}
