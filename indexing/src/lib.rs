//! **Indexing Service** - builds indexes inside storage-owned environments.
//!
//! This crate does NOT own databases. It receives borrowed [`KvEnv`] handles
//! and write transactions from `storage` and maintains three index kinds in
//! them:
//!
//! - **Structural indexes**: property-based filtering (equality, prefix,
//!   range) over a persistent B-tree
//! - **Graph indexes**: bidirectional adjacency with O(1) neighbor lookup
//! - **Vector indexes**: HNSW approximate nearest-neighbor search, one per
//!   resolution, rebuilt from the vectors table on demand
//!
//! plus a lock-free hot tier over recently touched vectors and adjacency
//! lists, and a set of graph algorithms over a borrowed [`GraphView`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Storage (Database Owner)                     │
//! │  - opens environments, defines tables                       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ borrowed env handles + write txns
//!                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            IndexManager (Service)                           │
//! │  ┌───────────────┬──────────────┬────────────────────────┐  │
//! │  │ Structural    │ Graph        │ Vector (HNSW)          │  │
//! │  │ (B-tree)      │ (Adjacency)  │ + hot tier overlay     │  │
//! │  └───────────────┴──────────────┴────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Structural and graph mutations run inside the caller's write transaction,
//! so index and data commit together. The in-memory HNSW is updated after
//! commit; it is rebuildable from the vectors table at any time, so it never
//! needs to survive a crash.

pub mod algorithms;
pub mod config;
pub mod distance;
pub mod graph;
pub mod hot;
pub mod structural;
pub mod vector;

pub use algorithms::{GraphView, MemGraph};
pub use config::{HnswConfig, HotTierConfig};
pub use distance::DistanceMetric;
pub use vector::{SearchResult, VectorIndex};

use common::models::{Edge, Embedding, Node, Resolution};
use common::{DbResult, EdgeId, NodeId};
use mdbx_base::{KvEnv, KvWriteTxn};

use crate::config::tables;

/// Index properties maintained for node types.
mod properties {
    pub const NODE_TYPE: &str = "node_type";
    pub const CHAT_ID: &str = "chat_id";
    pub const SENDER: &str = "sender";
    pub const ROLE: &str = "role";
    pub const TIMESTAMP: &str = "timestamp";
    pub const LABEL: &str = "label";
    pub const ENTITY_TYPE: &str = "entity_type";
    pub const STATUS: &str = "status";
    pub const SCOPE: &str = "scope";
    pub const TOOL_NAME: &str = "tool_name";
    pub const ACTION_TYPE: &str = "action_type";
    pub const OUTCOME_ID: &str = "outcome_id";
    pub const PATTERN_KIND: &str = "pattern_kind";
}

/// Coordinates structural, graph, and vector indexing for one environment.
pub struct IndexManager {
    hnsw: HnswConfig,
    vectors_fast: VectorIndex,
    vectors_accurate: VectorIndex,
    hot_vectors: hot::HotVectorCache,
    hot_graph: hot::HotGraphCache,
}

impl IndexManager {
    /// Creates an index manager with the given configuration.
    pub fn new(hnsw: HnswConfig, hot_tier: HotTierConfig) -> Self {
        Self {
            hnsw,
            vectors_fast: VectorIndex::new(Resolution::Fast384, hnsw),
            vectors_accurate: VectorIndex::new(Resolution::Accurate1536, hnsw),
            hot_vectors: hot::HotVectorCache::new(hot_tier),
            hot_graph: hot::HotGraphCache::new(hot_tier),
        }
    }

    /// The HNSW configuration in force.
    pub fn hnsw_config(&self) -> HnswConfig {
        self.hnsw
    }

    /// Creates every index table this service uses in `env`.
    pub fn ensure_tables(env: &KvEnv) -> DbResult<()> {
        for table in [
            tables::STRUCTURAL_INDEX,
            tables::GRAPH_OUTGOING,
            tables::GRAPH_INCOMING,
            tables::VECTOR_LOG,
        ] {
            env.ensure_table(table)?;
        }
        Ok(())
    }

    // --- Node indexing ---

    /// Indexed `(property, value)` pairs for a node. The typed core only;
    /// metadata is invisible to indexes.
    fn node_properties(node: &Node) -> Vec<(&'static str, String)> {
        let mut props = vec![(properties::NODE_TYPE, node.type_name().to_string())];
        match node {
            Node::Chat(c) => {
                props.push((properties::TIMESTAMP, structural::encode_i64(c.updated_at)));
            }
            Node::Message(m) => {
                props.push((properties::CHAT_ID, m.chat_id.as_str().to_string()));
                props.push((properties::SENDER, m.sender.clone()));
                props.push((properties::ROLE, m.role.name().to_string()));
                props.push((properties::TIMESTAMP, structural::encode_i64(m.timestamp)));
            }
            Node::Entity(e) => {
                props.push((properties::LABEL, e.label.clone()));
                props.push((properties::ENTITY_TYPE, e.entity_type.clone()));
                props.push((properties::STATUS, e.status.name().to_string()));
            }
            Node::Summary(s) => {
                props.push((properties::SCOPE, s.scope.name().to_string()));
                props.push((properties::TIMESTAMP, structural::encode_i64(s.start_ts)));
            }
            Node::ToolResult(t) => {
                props.push((properties::TOOL_NAME, t.tool_name.clone()));
                props.push((properties::TIMESTAMP, structural::encode_i64(t.fetched_at)));
            }
            Node::ActionOutcome(a) => {
                props.push((properties::ACTION_TYPE, a.action_type.clone()));
                props.push((properties::TIMESTAMP, structural::encode_i64(a.timestamp)));
            }
            Node::UserFeedback(f) => {
                props.push((properties::OUTCOME_ID, f.outcome_id.as_str().to_string()));
                props.push((properties::TIMESTAMP, structural::encode_i64(f.timestamp)));
            }
            Node::Pattern(p) => {
                props.push((properties::PATTERN_KIND, p.kind.name().to_string()));
            }
        }
        props
    }

    /// Adds a node to the structural index within the caller's transaction.
    pub fn index_node(&self, txn: &KvWriteTxn<'_>, node: &Node) -> DbResult<()> {
        let id = node.id().as_str();
        for (property, value) in Self::node_properties(node) {
            structural::add(txn, property, &value, id)?;
        }
        Ok(())
    }

    /// Removes a node from the structural index within the caller's
    /// transaction.
    pub fn unindex_node(&self, txn: &KvWriteTxn<'_>, node: &Node) -> DbResult<()> {
        let id = node.id().as_str();
        for (property, value) in Self::node_properties(node) {
            structural::remove(txn, property, &value, id)?;
        }
        Ok(())
    }

    // --- Edge indexing ---

    /// Adds an edge to both adjacency tables within the caller's
    /// transaction and invalidates the hot tier for both endpoints.
    pub fn index_edge(&self, txn: &KvWriteTxn<'_>, edge: &Edge) -> DbResult<()> {
        graph::add_edge(txn, edge)?;
        self.hot_graph.invalidate(edge.from_node.as_str());
        self.hot_graph.invalidate(edge.to_node.as_str());
        Ok(())
    }

    /// Removes an edge from both adjacency tables within the caller's
    /// transaction and invalidates the hot tier for both endpoints.
    pub fn unindex_edge(&self, txn: &KvWriteTxn<'_>, edge: &Edge) -> DbResult<()> {
        graph::remove_edge(txn, edge)?;
        self.hot_graph.invalidate(edge.from_node.as_str());
        self.hot_graph.invalidate(edge.to_node.as_str());
        Ok(())
    }

    /// Outgoing neighbors, hot tier first.
    pub fn outgoing(&self, env: &KvEnv, node_id: &str) -> DbResult<Vec<(EdgeId, NodeId)>> {
        if let Some((out, _)) = self.hot_graph.get(node_id) {
            return Ok(out);
        }
        let out = graph::outgoing(env, node_id)?;
        let inc = graph::incoming(env, node_id)?;
        self.hot_graph.insert(node_id, out.clone(), inc);
        Ok(out)
    }

    /// Incoming neighbors, hot tier first.
    pub fn incoming(&self, env: &KvEnv, node_id: &str) -> DbResult<Vec<(EdgeId, NodeId)>> {
        if let Some((_, inc)) = self.hot_graph.get(node_id) {
            return Ok(inc);
        }
        let out = graph::outgoing(env, node_id)?;
        let inc = graph::incoming(env, node_id)?;
        self.hot_graph.insert(node_id, out, inc.clone());
        Ok(inc)
    }

    // --- Embedding / vector indexing ---

    fn vector_index(&self, resolution: Resolution) -> &VectorIndex {
        match resolution {
            Resolution::Fast384 => &self.vectors_fast,
            Resolution::Accurate1536 => &self.vectors_accurate,
        }
    }

    /// Appends an insert record to the vector mutation log within the
    /// caller's transaction. The log makes lazily opened tiers cheap to
    /// catch up without a full table scan.
    pub fn log_vector_insert(&self, txn: &KvWriteTxn<'_>, embedding: &Embedding) -> DbResult<()> {
        let seq = format!("{:020}:{}", common::now_ms(), embedding.id.as_str());
        let record = bincode::serialize(&("insert", embedding.id.as_str()))?;
        txn.put(tables::VECTOR_LOG, seq.as_bytes(), &record)
    }

    /// Appends a delete record to the vector mutation log.
    pub fn log_vector_delete(&self, txn: &KvWriteTxn<'_>, id: &common::EmbeddingId) -> DbResult<()> {
        let seq = format!("{:020}:{}", common::now_ms(), id.as_str());
        let record = bincode::serialize(&("delete", id.as_str()))?;
        txn.put(tables::VECTOR_LOG, seq.as_bytes(), &record)
    }

    /// Inserts a committed embedding into the in-memory HNSW and the hot
    /// tier. Call after the owning transaction commits, so every index entry
    /// always has a backing row.
    pub fn vector_insert(&self, embedding: &Embedding) -> DbResult<()> {
        self.vector_index(embedding.resolution)
            .insert(&embedding.id, &embedding.vector)?;
        self.hot_vectors
            .insert(embedding.id.as_str(), &embedding.vector);
        Ok(())
    }

    /// Tombstones an embedding in the in-memory HNSW and hot tier.
    pub fn vector_remove(&self, resolution: Resolution, id: &common::EmbeddingId) {
        self.vector_index(resolution).remove(id);
        self.hot_vectors.invalidate(id.as_str());
    }

    /// Top-k vector search at the given resolution.
    pub fn search_vectors(
        &self,
        resolution: Resolution,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> DbResult<Vec<SearchResult>> {
        self.vector_index(resolution).search(query, k, ef_search)
    }

    /// Number of live vectors at a resolution.
    pub fn vector_len(&self, resolution: Resolution) -> usize {
        self.vector_index(resolution).len()
    }

    /// Cached vector lookup, hot tier first, falling back to the embeddings
    /// table.
    pub fn vector_of(&self, env: &KvEnv, id: &common::EmbeddingId) -> DbResult<Option<Vec<f32>>> {
        if let Some(v) = self.hot_vectors.get(id.as_str()) {
            return Ok(Some(v));
        }
        match env.get(tables::EMBEDDINGS, id.as_str().as_bytes())? {
            Some(bytes) => {
                let embedding: Embedding = bincode::deserialize(&bytes)?;
                self.hot_vectors.admit(id.as_str(), &embedding.vector);
                Ok(Some(embedding.vector))
            }
            None => Ok(None),
        }
    }

    // --- Structural queries ---

    /// Node ids with `property == value`.
    pub fn nodes_by_property(&self, env: &KvEnv, property: &str, value: &str) -> DbResult<Vec<NodeId>> {
        structural::get(env, property, value)
    }

    /// Node ids whose encoded timestamp is within `[low, high]`.
    pub fn nodes_by_time_range(&self, env: &KvEnv, low_ms: i64, high_ms: i64) -> DbResult<Vec<NodeId>> {
        structural::get_range(
            env,
            properties::TIMESTAMP,
            &structural::encode_i64(low_ms),
            &structural::encode_i64(high_ms),
        )
    }

    // --- Rebuilds ---

    /// Loads the HNSW indexes from the environment's embeddings table.
    ///
    /// Returns the number of vectors loaded. Called at open and after
    /// corruption recovery; the log table is truncated afterwards since the
    /// graph now reflects the full table.
    pub fn load_vectors(&self, env: &KvEnv) -> DbResult<usize> {
        let mut fast = Vec::new();
        let mut accurate = Vec::new();
        for (_, bytes) in env.iter_table(tables::EMBEDDINGS)? {
            let embedding: Embedding = bincode::deserialize(&bytes)?;
            match embedding.resolution {
                Resolution::Fast384 => fast.push((embedding.id, embedding.vector)),
                Resolution::Accurate1536 => accurate.push((embedding.id, embedding.vector)),
            }
        }
        let count = self.vectors_fast.rebuild(fast)? + self.vectors_accurate.rebuild(accurate)?;

        let log_keys: Vec<Vec<u8>> = env
            .scan_prefix(tables::VECTOR_LOG, b"")?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        if !log_keys.is_empty() {
            let txn = env.begin_write()?;
            for key in log_keys {
                txn.delete(tables::VECTOR_LOG, &key)?;
            }
            txn.commit()?;
        }

        Ok(count)
    }

    /// Truncates and rebuilds the structural index from the nodes table.
    pub fn rebuild_structural(&self, env: &KvEnv) -> DbResult<usize> {
        structural::clear(env)?;
        let mut count = 0;
        for (_, bytes) in env.iter_table(tables::NODES)? {
            let node: Node = bincode::deserialize(&bytes)?;
            let txn = env.begin_write()?;
            self.index_node(&txn, &node)?;
            txn.commit()?;
            count += 1;
        }
        log::info!("rebuilt structural index over {count} nodes");
        Ok(count)
    }

    /// Truncates and rebuilds both adjacency tables from the edges table.
    pub fn rebuild_graph(&self, env: &KvEnv) -> DbResult<usize> {
        graph::clear(env)?;
        let mut count = 0;
        for (_, bytes) in env.iter_table(tables::EDGES)? {
            let edge: Edge = bincode::deserialize(&bytes)?;
            let txn = env.begin_write()?;
            self.index_edge(&txn, &edge)?;
            txn.commit()?;
            count += 1;
        }
        log::info!("rebuilt graph index over {count} edges");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_env() -> (KvEnv, IndexManager, TempDir) {
        let temp = TempDir::new().unwrap();
        let env = KvEnv::open(&temp.path().join("db"), 32).unwrap();
        IndexManager::ensure_tables(&env).unwrap();
        env.ensure_table(tables::NODES).unwrap();
        env.ensure_table(tables::EDGES).unwrap();
        env.ensure_table(tables::EMBEDDINGS).unwrap();
        let manager = IndexManager::new(
            HnswConfig {
                initial_capacity: 1_000,
                ..HnswConfig::default()
            },
            HotTierConfig::default(),
        );
        (env, manager, temp)
    }

    fn test_message(id: &str, chat: &str, ts: i64) -> Node {
        Node::Message(common::models::Message {
            id: NodeId::new(id),
            chat_id: NodeId::new(chat),
            sender: "user".to_string(),
            role: common::models::Role::User,
            timestamp: ts,
            text_content: "hello".to_string(),
            attachment_refs: vec![],
            metadata: json!({}),
        })
    }

    #[test]
    fn test_index_node_by_chat_and_time() {
        let (env, manager, _temp) = create_test_env();

        let txn = env.begin_write().unwrap();
        manager.index_node(&txn, &test_message("msg_1", "chat_1", 1_000)).unwrap();
        manager.index_node(&txn, &test_message("msg_2", "chat_1", 2_000)).unwrap();
        manager.index_node(&txn, &test_message("msg_3", "chat_2", 3_000)).unwrap();
        txn.commit().unwrap();

        let by_chat = manager.nodes_by_property(&env, "chat_id", "chat_1").unwrap();
        assert_eq!(by_chat.len(), 2);

        let by_time = manager.nodes_by_time_range(&env, 1_500, 2_500).unwrap();
        assert_eq!(by_time, vec![NodeId::new("msg_2")]);
    }

    #[test]
    fn test_unindex_node() {
        let (env, manager, _temp) = create_test_env();
        let node = test_message("msg_1", "chat_1", 1_000);

        let txn = env.begin_write().unwrap();
        manager.index_node(&txn, &node).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_write().unwrap();
        manager.unindex_node(&txn, &node).unwrap();
        txn.commit().unwrap();

        assert!(manager.nodes_by_property(&env, "chat_id", "chat_1").unwrap().is_empty());
        assert!(manager.nodes_by_property(&env, "node_type", "Message").unwrap().is_empty());
    }

    #[test]
    fn test_edge_index_and_hot_invalidation() {
        let (env, manager, _temp) = create_test_env();
        let edge = Edge {
            id: EdgeId::new("e1"),
            from_node: NodeId::new("msg_1"),
            to_node: NodeId::new("ent_1"),
            relation_type: "MENTIONS".to_string(),
            weight: 1.0,
            source_message_id: None,
            created_at: 0,
            metadata: json!({}),
        };

        let txn = env.begin_write().unwrap();
        manager.index_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        // First read fills the hot tier, second is served from it.
        assert_eq!(manager.outgoing(&env, "msg_1").unwrap().len(), 1);
        assert_eq!(manager.outgoing(&env, "msg_1").unwrap().len(), 1);
        assert_eq!(manager.incoming(&env, "ent_1").unwrap().len(), 1);

        let txn = env.begin_write().unwrap();
        manager.unindex_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        assert!(manager.outgoing(&env, "msg_1").unwrap().is_empty());
        assert!(manager.incoming(&env, "ent_1").unwrap().is_empty());
    }

    #[test]
    fn test_vector_round_trip_and_rebuild() {
        let (env, manager, _temp) = create_test_env();

        let mut vector = vec![0.0f32; 384];
        vector[7] = 1.0;
        let embedding = Embedding {
            id: common::EmbeddingId::new("emb:fast:msg_1"),
            source_id: NodeId::new("msg_1"),
            resolution: Resolution::Fast384,
            vector: vector.clone(),
            model_version: "fast-v1".to_string(),
        };

        // Persist the row, log the mutation, then update the live index.
        let txn = env.begin_write().unwrap();
        txn.put(
            tables::EMBEDDINGS,
            embedding.id.as_str().as_bytes(),
            &bincode::serialize(&embedding).unwrap(),
        )
        .unwrap();
        manager.log_vector_insert(&txn, &embedding).unwrap();
        txn.commit().unwrap();
        manager.vector_insert(&embedding).unwrap();

        let hits = manager
            .search_vectors(Resolution::Fast384, &vector, 5, 50)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "emb:fast:msg_1");

        // Hot tier serves the vector; a cold manager falls back to the table.
        assert_eq!(
            manager.vector_of(&env, &embedding.id).unwrap(),
            Some(vector.clone())
        );

        // A fresh manager rebuilds the same queryable state from the table.
        let fresh = IndexManager::new(
            HnswConfig {
                initial_capacity: 1_000,
                ..HnswConfig::default()
            },
            HotTierConfig::default(),
        );
        let loaded = fresh.load_vectors(&env).unwrap();
        assert_eq!(loaded, 1);
        let hits = fresh
            .search_vectors(Resolution::Fast384, &vector, 5, 50)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(env.iter_table(tables::VECTOR_LOG).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_structural_matches_original() {
        let (env, manager, _temp) = create_test_env();
        let node = test_message("msg_1", "chat_1", 1_000);

        let txn = env.begin_write().unwrap();
        txn.put(
            tables::NODES,
            b"msg_1",
            &bincode::serialize(&node).unwrap(),
        )
        .unwrap();
        manager.index_node(&txn, &node).unwrap();
        txn.commit().unwrap();

        let before = manager.nodes_by_property(&env, "chat_id", "chat_1").unwrap();
        let rebuilt = manager.rebuild_structural(&env).unwrap();
        let after = manager.nodes_by_property(&env, "chat_id", "chat_1").unwrap();

        assert_eq!(rebuilt, 1);
        assert_eq!(before, after);
    }
}
