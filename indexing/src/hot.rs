//! Lock-free hot-tier overlays.
//!
//! In-memory caches over vectors and adjacency lists that saw recent access.
//! Reads try the hot tier first and fall back to the persistent index on a
//! miss; writes update both. Eviction is LRU with an admission threshold so
//! one-off scans do not churn the cache.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Instant;

use common::{EdgeId, NodeId};

use crate::config::HotTierConfig;

/// Monotonic millisecond clock for LRU bookkeeping.
fn mono_ms(epoch: Instant) -> i64 {
    epoch.elapsed().as_millis() as i64
}

struct VectorEntry {
    vector: Vec<f32>,
    last_access: AtomicI64,
}

/// Hot cache over embedding vectors, keyed by embedding id.
pub struct HotVectorCache {
    entries: DashMap<String, VectorEntry>,
    pending: DashMap<String, AtomicU32>,
    config: HotTierConfig,
    epoch: Instant,
}

impl HotVectorCache {
    pub fn new(config: HotTierConfig) -> Self {
        Self {
            entries: DashMap::new(),
            pending: DashMap::new(),
            config,
            epoch: Instant::now(),
        }
    }

    /// Fetches a vector, refreshing its recency on hit.
    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        let entry = self.entries.get(id)?;
        entry
            .last_access
            .store(mono_ms(self.epoch), Ordering::Relaxed);
        Some(entry.vector.clone())
    }

    /// Records an access and admits the vector once it crosses the
    /// admission threshold. Writes (miss-fills) go through here too.
    pub fn admit(&self, id: &str, vector: &[f32]) {
        let hits = {
            let counter = self
                .pending
                .entry(id.to_string())
                .or_insert_with(|| AtomicU32::new(0));
            counter.fetch_add(1, Ordering::Relaxed) + 1
        };
        if hits < self.config.admission_threshold {
            return;
        }
        self.pending.remove(id);
        self.insert(id, vector);
    }

    /// Unconditionally caches a vector (used on write-through).
    pub fn insert(&self, id: &str, vector: &[f32]) {
        self.entries.insert(
            id.to_string(),
            VectorEntry {
                vector: vector.to_vec(),
                last_access: AtomicI64::new(mono_ms(self.epoch)),
            },
        );
        self.evict_if_needed();
    }

    /// Drops a cached vector (write invalidation).
    pub fn invalidate(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_needed(&self) {
        if self.entries.len() <= self.config.capacity {
            return;
        }

        let now = mono_ms(self.epoch);
        let ttl_ms = self.config.idle_ttl_secs as i64 * 1000;

        // First pass: drop idle entries.
        self.entries
            .retain(|_, entry| now - entry.last_access.load(Ordering::Relaxed) <= ttl_ms);

        // Still over: drop the coldest entries.
        while self.entries.len() > self.config.capacity {
            let coldest = self
                .entries
                .iter()
                .min_by_key(|e| e.last_access.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match coldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

struct AdjacencyEntry {
    outgoing: Vec<(EdgeId, NodeId)>,
    incoming: Vec<(EdgeId, NodeId)>,
    last_access: AtomicI64,
}

/// Hot cache over adjacency lists, keyed by node id.
pub struct HotGraphCache {
    entries: DashMap<String, AdjacencyEntry>,
    config: HotTierConfig,
    epoch: Instant,
}

impl HotGraphCache {
    pub fn new(config: HotTierConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            epoch: Instant::now(),
        }
    }

    /// Cached `(outgoing, incoming)` adjacency for a node.
    pub fn get(&self, node_id: &str) -> Option<(Vec<(EdgeId, NodeId)>, Vec<(EdgeId, NodeId)>)> {
        let entry = self.entries.get(node_id)?;
        entry
            .last_access
            .store(mono_ms(self.epoch), Ordering::Relaxed);
        Some((entry.outgoing.clone(), entry.incoming.clone()))
    }

    /// Fills the cache after a cold read.
    pub fn insert(
        &self,
        node_id: &str,
        outgoing: Vec<(EdgeId, NodeId)>,
        incoming: Vec<(EdgeId, NodeId)>,
    ) {
        self.entries.insert(
            node_id.to_string(),
            AdjacencyEntry {
                outgoing,
                incoming,
                last_access: AtomicI64::new(mono_ms(self.epoch)),
            },
        );
        self.evict_if_needed();
    }

    /// Drops a node's cached adjacency; called on every edge mutation that
    /// touches it.
    pub fn invalidate(&self, node_id: &str) {
        self.entries.remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_needed(&self) {
        if self.entries.len() <= self.config.capacity {
            return;
        }

        let now = mono_ms(self.epoch);
        let ttl_ms = self.config.idle_ttl_secs as i64 * 1000;
        self.entries
            .retain(|_, entry| now - entry.last_access.load(Ordering::Relaxed) <= ttl_ms);

        while self.entries.len() > self.config.capacity {
            let coldest = self
                .entries
                .iter()
                .min_by_key(|e| e.last_access.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            match coldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> HotTierConfig {
        HotTierConfig {
            capacity: 2,
            idle_ttl_secs: 3600,
            admission_threshold: 2,
        }
    }

    #[test]
    fn test_admission_threshold() {
        let cache = HotVectorCache::new(tiny_config());

        cache.admit("a", &[1.0]);
        assert!(cache.get("a").is_none(), "one access should not admit");

        cache.admit("a", &[1.0]);
        assert_eq!(cache.get("a"), Some(vec![1.0]));
    }

    #[test]
    fn test_vector_eviction_keeps_capacity() {
        let cache = HotVectorCache::new(tiny_config());

        cache.insert("a", &[1.0]);
        cache.insert("b", &[2.0]);
        cache.insert("c", &[3.0]);

        assert!(cache.len() <= 2);
        assert_eq!(cache.get("c"), Some(vec![3.0]), "newest entry survives");
    }

    #[test]
    fn test_invalidate() {
        let cache = HotVectorCache::new(tiny_config());
        cache.insert("a", &[1.0]);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_graph_cache_roundtrip() {
        let cache = HotGraphCache::new(tiny_config());
        let out = vec![(EdgeId::new("e1"), NodeId::new("n2"))];
        let inc = vec![(EdgeId::new("e2"), NodeId::new("n3"))];

        cache.insert("n1", out.clone(), inc.clone());
        let (got_out, got_inc) = cache.get("n1").unwrap();
        assert_eq!(got_out, out);
        assert_eq!(got_inc, inc);

        cache.invalidate("n1");
        assert!(cache.get("n1").is_none());
    }
}
