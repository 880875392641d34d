//! Configuration constants and structures for the indexing crate.
//!
//! Domain-specific values live in constants and enums instead of being
//! scattered as magic strings.

/// Database table names used by the indexing service.
///
/// These tables live inside storage-owned environments; indexing never opens
/// an environment of its own.
pub mod tables {
    /// Node records (owned by storage, read here during rebuilds).
    pub const NODES: &str = "nodes";

    /// Edge records (owned by storage, read here during rebuilds).
    pub const EDGES: &str = "edges";

    /// Embedding records (owned by storage, read here when loading vectors).
    pub const EMBEDDINGS: &str = "embeddings";

    /// Structural index table (property -> value -> node ids).
    pub const STRUCTURAL_INDEX: &str = "structural_index";

    /// Graph outgoing-adjacency table (`out:{node}` -> [(edge, target)]).
    pub const GRAPH_OUTGOING: &str = "graph_outgoing";

    /// Graph incoming-adjacency table (`in:{node}` -> [(edge, source)]).
    pub const GRAPH_INCOMING: &str = "graph_incoming";

    /// Append-only vector mutation log.
    pub const VECTOR_LOG: &str = "vector_log";
}

/// HNSW index configuration.
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Maximum number of bi-directional links per node (M parameter).
    pub max_connections: usize,

    /// Size of the dynamic candidate list during construction.
    pub ef_construction: usize,

    /// Default query-time breadth.
    pub ef_search: usize,

    /// Capacity hint for layer sizing.
    pub initial_capacity: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            ef_construction: 200,
            ef_search: 50,
            initial_capacity: 100_000,
        }
    }
}

impl HnswConfig {
    /// Number of HNSW layers for the configured capacity.
    pub fn num_layers(&self) -> usize {
        ((self.initial_capacity as f32).ln().trunc() as usize).clamp(1, 16)
    }
}

/// Hot-tier cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct HotTierConfig {
    /// Maximum entries per hot cache.
    pub capacity: usize,

    /// Entries idle longer than this are eviction candidates.
    pub idle_ttl_secs: u64,

    /// Minimum accesses before an entry is admitted.
    pub admission_threshold: u32,
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            idle_ttl_secs: 600,
            admission_threshold: 2,
        }
    }
}
