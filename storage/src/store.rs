//! Per-environment storage manager.
//!
//! One `StorageManager` owns one tier environment and performs all typed
//! CRUD on it. Structural and graph index updates run inside the same write
//! transaction as the data they index; the in-memory vector index is
//! refreshed after commit (it is rebuildable, so it never needs to survive
//! a crash). Every committed write emits a mutation event.

use std::path::Path;
use std::sync::Arc;

use common::models::{Edge, Embedding, Node};
use common::{DbError, DbResult, EmbeddingId, NodeId};
use indexing::config::tables;
use indexing::{HnswConfig, HotTierConfig, IndexManager, SearchResult};
use mdbx_base::KvEnv;

use crate::database_type::{DatabaseKind, TemperatureTier};
use crate::events::{EventBus, MutationEvent, MutationKind};

/// Named tables per environment beyond the index tables.
const DATA_TABLES: [&str; 3] = [tables::NODES, tables::EDGES, tables::EMBEDDINGS];

/// Maximum named tables per environment.
const MAX_TABLES: usize = 32;

fn decode_node(bytes: &[u8]) -> DbResult<Node> {
    bincode::deserialize(bytes).map_err(|e| DbError::Corrupt(format!("node record: {e}")))
}

fn decode_edge(bytes: &[u8]) -> DbResult<Edge> {
    bincode::deserialize(bytes).map_err(|e| DbError::Corrupt(format!("edge record: {e}")))
}

fn decode_embedding(bytes: &[u8]) -> DbResult<Embedding> {
    bincode::deserialize(bytes).map_err(|e| DbError::Corrupt(format!("embedding record: {e}")))
}

/// Manages all direct interactions with one tier environment.
pub struct StorageManager {
    env: KvEnv,
    kind: DatabaseKind,
    tier: Option<TemperatureTier>,
    index: Arc<IndexManager>,
    events: Option<EventBus>,
}

impl StorageManager {
    /// Opens or creates the environment at `path` with indexing attached.
    ///
    /// All data and index tables are created up front so read transactions
    /// never race table creation. For `Embeddings` environments the HNSW is
    /// loaded from the vectors table.
    pub fn open(
        path: &Path,
        kind: DatabaseKind,
        tier: Option<TemperatureTier>,
        hnsw: HnswConfig,
        events: Option<EventBus>,
    ) -> DbResult<Self> {
        let env = KvEnv::open(path, MAX_TABLES)?;
        for table in DATA_TABLES {
            env.ensure_table(table)?;
        }
        IndexManager::ensure_tables(&env)?;

        let index = Arc::new(IndexManager::new(hnsw, HotTierConfig::default()));
        if kind == DatabaseKind::Embeddings {
            let loaded = index.load_vectors(&env)?;
            log::debug!(
                "loaded {loaded} vectors for {} ({})",
                kind.name(),
                tier.map(|t| t.name()).unwrap_or("flat"),
            );
        }

        Ok(Self {
            env,
            kind,
            tier,
            index,
            events,
        })
    }

    /// The logical database this manager serves.
    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// The tier this manager serves, if tiered.
    pub fn tier(&self) -> Option<TemperatureTier> {
        self.tier
    }

    /// Borrowed handle to the underlying environment.
    ///
    /// Services (indexing, query) receive this; they never open or close
    /// environments themselves.
    pub fn env(&self) -> &KvEnv {
        &self.env
    }

    /// The index service attached to this environment.
    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    fn emit(&self, kind: MutationKind, id: &str, node_type: Option<&'static str>) {
        if let Some(bus) = &self.events {
            bus.emit(MutationEvent {
                db: self.kind,
                kind,
                id: id.to_string(),
                node_type,
            });
        }
    }

    // --- Node Operations ---

    /// Retrieves a node by id.
    pub fn get_node(&self, id: &str) -> DbResult<Option<Node>> {
        match self.env.get(tables::NODES, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_node(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or updates a node, maintaining indexes in the same
    /// transaction.
    pub fn insert_node(&self, node: &Node) -> DbResult<()> {
        self.insert_nodes(std::slice::from_ref(node))
    }

    /// Inserts or updates a batch of nodes atomically (one transaction, one
    /// environment).
    pub fn insert_nodes(&self, nodes: &[Node]) -> DbResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let txn = self.env.begin_write()?;
        for node in nodes {
            let id = node.id().as_str();
            // Upsert: drop stale index entries for a previous version first.
            if let Some(old_bytes) = txn.get(tables::NODES, id.as_bytes())? {
                let old = decode_node(&old_bytes)?;
                self.index.unindex_node(&txn, &old)?;
            }
            let bytes = bincode::serialize(node)?;
            txn.put(tables::NODES, id.as_bytes(), &bytes)?;
            self.index.index_node(&txn, node)?;
        }
        txn.commit()?;

        for node in nodes {
            self.emit(
                MutationKind::NodeInserted,
                node.id().as_str(),
                Some(node.type_name()),
            );
        }
        Ok(())
    }

    /// Deletes a node, returning it if it existed.
    pub fn delete_node(&self, id: &str) -> DbResult<Option<Node>> {
        self.delete_nodes(std::slice::from_ref(&NodeId::new(id)))
            .map(|mut nodes| nodes.pop())
    }

    /// Deletes a batch of nodes atomically, returning the removed records.
    pub fn delete_nodes(&self, ids: &[NodeId]) -> DbResult<Vec<Node>> {
        let txn = self.env.begin_write()?;
        let mut removed = Vec::new();
        for id in ids {
            if let Some(bytes) = txn.get(tables::NODES, id.as_str().as_bytes())? {
                let node = decode_node(&bytes)?;
                self.index.unindex_node(&txn, &node)?;
                txn.delete(tables::NODES, id.as_str().as_bytes())?;
                removed.push(node);
            }
        }
        txn.commit()?;

        for node in &removed {
            self.emit(
                MutationKind::NodeDeleted,
                node.id().as_str(),
                Some(node.type_name()),
            );
        }
        Ok(removed)
    }

    /// All nodes in this environment. Full scan; rebuilds and backfills
    /// only.
    pub fn iter_nodes(&self) -> DbResult<Vec<Node>> {
        self.env
            .iter_table(tables::NODES)?
            .iter()
            .map(|(_, bytes)| decode_node(bytes))
            .collect()
    }

    /// Number of node records.
    pub fn node_count(&self) -> DbResult<usize> {
        self.env.table_len(tables::NODES)
    }

    /// Node ids matching `property == value` via the structural index.
    pub fn nodes_by_property(&self, property: &str, value: &str) -> DbResult<Vec<NodeId>> {
        self.index.nodes_by_property(&self.env, property, value)
    }

    /// Messages of a chat ordered by timestamp, optionally bounded to
    /// `[start_ms, end_ms]`.
    pub fn messages_by_chat(
        &self,
        chat_id: &str,
        time_range: Option<(i64, i64)>,
    ) -> DbResult<Vec<common::models::Message>> {
        let ids = self.nodes_by_property("chat_id", chat_id)?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(Node::Message(message)) = self.get_node(id.as_str())? {
                if let Some((start, end)) = time_range {
                    if message.timestamp < start || message.timestamp > end {
                        continue;
                    }
                }
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    // --- Edge Operations ---

    /// Retrieves an edge by id.
    pub fn get_edge(&self, id: &str) -> DbResult<Option<Edge>> {
        match self.env.get(tables::EDGES, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_edge(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or updates an edge; both adjacency directions update in the
    /// same transaction.
    pub fn insert_edge(&self, edge: &Edge) -> DbResult<()> {
        let txn = self.env.begin_write()?;
        if let Some(old_bytes) = txn.get(tables::EDGES, edge.id.as_str().as_bytes())? {
            let old = decode_edge(&old_bytes)?;
            self.index.unindex_edge(&txn, &old)?;
        }
        let bytes = bincode::serialize(edge)?;
        txn.put(tables::EDGES, edge.id.as_str().as_bytes(), &bytes)?;
        self.index.index_edge(&txn, edge)?;
        txn.commit()?;

        self.emit(MutationKind::EdgeInserted, edge.id.as_str(), None);
        Ok(())
    }

    /// Deletes an edge, removing it from both adjacency directions
    /// atomically.
    pub fn delete_edge(&self, id: &str) -> DbResult<Option<Edge>> {
        let txn = self.env.begin_write()?;
        let Some(bytes) = txn.get(tables::EDGES, id.as_bytes())? else {
            return Ok(None);
        };
        let edge = decode_edge(&bytes)?;
        self.index.unindex_edge(&txn, &edge)?;
        txn.delete(tables::EDGES, id.as_bytes())?;
        txn.commit()?;

        self.emit(MutationKind::EdgeDeleted, id, None);
        Ok(Some(edge))
    }

    /// All edges in this environment.
    pub fn iter_edges(&self) -> DbResult<Vec<Edge>> {
        self.env
            .iter_table(tables::EDGES)?
            .iter()
            .map(|(_, bytes)| decode_edge(bytes))
            .collect()
    }

    /// Outgoing `(edge_id, target)` pairs via the graph index.
    pub fn outgoing(&self, node_id: &str) -> DbResult<Vec<(common::EdgeId, NodeId)>> {
        self.index.outgoing(&self.env, node_id)
    }

    /// Incoming `(edge_id, source)` pairs via the graph index.
    pub fn incoming(&self, node_id: &str) -> DbResult<Vec<(common::EdgeId, NodeId)>> {
        self.index.incoming(&self.env, node_id)
    }

    // --- Embedding Operations ---

    /// Retrieves an embedding by id.
    pub fn get_embedding(&self, id: &str) -> DbResult<Option<Embedding>> {
        match self.env.get(tables::EMBEDDINGS, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_embedding(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces an embedding.
    ///
    /// The row and its mutation-log entry commit together; the in-memory
    /// HNSW is updated after commit so the index can never reference a row
    /// that was rolled back.
    pub fn insert_embedding(&self, embedding: &Embedding) -> DbResult<()> {
        let txn = self.env.begin_write()?;
        let bytes = bincode::serialize(embedding)?;
        txn.put(tables::EMBEDDINGS, embedding.id.as_str().as_bytes(), &bytes)?;
        self.index.log_vector_insert(&txn, embedding)?;
        txn.commit()?;

        self.index.vector_insert(embedding)?;
        self.emit(MutationKind::EmbeddingInserted, embedding.id.as_str(), None);
        Ok(())
    }

    /// Deletes an embedding, tombstoning it in the HNSW.
    pub fn delete_embedding(&self, id: &str) -> DbResult<Option<Embedding>> {
        let txn = self.env.begin_write()?;
        let Some(bytes) = txn.get(tables::EMBEDDINGS, id.as_bytes())? else {
            return Ok(None);
        };
        let embedding = decode_embedding(&bytes)?;
        txn.delete(tables::EMBEDDINGS, id.as_bytes())?;
        self.index
            .log_vector_delete(&txn, &EmbeddingId::new(id))?;
        txn.commit()?;

        self.index
            .vector_remove(embedding.resolution, &embedding.id);
        self.emit(MutationKind::EmbeddingDeleted, id, None);
        Ok(Some(embedding))
    }

    /// Top-k vector search at a resolution.
    pub fn search_vectors(
        &self,
        resolution: common::models::Resolution,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> DbResult<Vec<SearchResult>> {
        self.index.search_vectors(resolution, query, k, ef_search)
    }

    /// Flushes this environment to disk.
    pub fn sync(&self) -> DbResult<()> {
        self.env.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{Chat, Message, Resolution, Role};
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp(kind: DatabaseKind) -> (StorageManager, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = StorageManager::open(
            &temp.path().join("db"),
            kind,
            Some(TemperatureTier::Active),
            HnswConfig {
                initial_capacity: 1_000,
                ..HnswConfig::default()
            },
            None,
        )
        .unwrap();
        (store, temp)
    }

    fn test_chat(id: &str) -> Node {
        Node::Chat(Chat {
            id: NodeId::new(id),
            title: "Test Chat".to_string(),
            created_at: 1697500000000,
            updated_at: 1697500000000,
            settings: json!({}),
            message_ids: vec![],
            metadata: json!({}),
        })
    }

    fn test_message(id: &str, chat: &str, ts: i64) -> Node {
        Node::Message(Message {
            id: NodeId::new(id),
            chat_id: NodeId::new(chat),
            sender: "user".to_string(),
            role: Role::User,
            timestamp: ts,
            text_content: format!("message {id}"),
            attachment_refs: vec![],
            metadata: json!({}),
        })
    }

    #[test]
    fn test_node_crud() {
        let (store, _temp) = open_temp(DatabaseKind::Conversations);

        store.insert_node(&test_chat("chat_001")).unwrap();

        let retrieved = store.get_node("chat_001").unwrap();
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().id().as_str(), "chat_001");

        // Update: title change shows up on re-read.
        let mut updated = test_chat("chat_001");
        if let Node::Chat(ref mut chat) = updated {
            chat.title = "Updated Title".to_string();
        }
        store.insert_node(&updated).unwrap();

        match store.get_node("chat_001").unwrap() {
            Some(Node::Chat(chat)) => assert_eq!(chat.title, "Updated Title"),
            other => panic!("Expected Chat node, got {other:?}"),
        }

        let deleted = store.delete_node("chat_001").unwrap();
        assert!(deleted.is_some());
        assert!(store.get_node("chat_001").unwrap().is_none());
    }

    #[test]
    fn test_reinsert_unchanged_payload_is_stable() {
        let (store, _temp) = open_temp(DatabaseKind::Conversations);
        let chat = test_chat("chat_001");

        store.insert_node(&chat).unwrap();
        store.insert_node(&chat).unwrap();

        assert_eq!(store.node_count().unwrap(), 1);
        assert_eq!(
            store.nodes_by_property("node_type", "Chat").unwrap().len(),
            1
        );
    }

    #[test]
    fn test_messages_by_chat_ordered_and_filtered() {
        let (store, _temp) = open_temp(DatabaseKind::Conversations);

        store.insert_node(&test_chat("chat_1")).unwrap();
        store.insert_node(&test_message("msg_b", "chat_1", 2_000)).unwrap();
        store.insert_node(&test_message("msg_a", "chat_1", 1_000)).unwrap();
        store.insert_node(&test_message("msg_c", "chat_1", 3_000)).unwrap();
        store.insert_node(&test_message("msg_x", "chat_2", 1_500)).unwrap();

        let all = store.messages_by_chat("chat_1", None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id.as_str(), "msg_a");
        assert_eq!(all[2].id.as_str(), "msg_c");

        let windowed = store.messages_by_chat("chat_1", Some((1_500, 2_500))).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id.as_str(), "msg_b");
    }

    #[test]
    fn test_batch_insert_and_delete() {
        let (store, _temp) = open_temp(DatabaseKind::Conversations);

        let nodes: Vec<Node> = (0..20)
            .map(|i| test_message(&format!("msg_{i:02}"), "chat_1", i as i64))
            .collect();
        store.insert_nodes(&nodes).unwrap();
        assert_eq!(store.node_count().unwrap(), 20);

        let ids: Vec<NodeId> = (0..10).map(|i| NodeId::new(format!("msg_{i:02}"))).collect();
        let removed = store.delete_nodes(&ids).unwrap();
        assert_eq!(removed.len(), 10);
        assert_eq!(store.node_count().unwrap(), 10);
        assert_eq!(store.nodes_by_property("chat_id", "chat_1").unwrap().len(), 10);
    }

    #[test]
    fn test_edge_round_trip_with_adjacency() {
        let (store, _temp) = open_temp(DatabaseKind::Knowledge);

        let edge = Edge {
            id: common::EdgeId::new("edge_1"),
            from_node: NodeId::new("msg_1"),
            to_node: NodeId::new("ent_1"),
            relation_type: "MENTIONS".to_string(),
            weight: 1.0,
            source_message_id: Some(NodeId::new("msg_1")),
            created_at: 1697500000000,
            metadata: json!({}),
        };
        store.insert_edge(&edge).unwrap();

        assert_eq!(store.get_edge("edge_1").unwrap().unwrap().relation_type, "MENTIONS");
        assert_eq!(store.outgoing("msg_1").unwrap().len(), 1);
        assert_eq!(store.incoming("ent_1").unwrap().len(), 1);

        store.delete_edge("edge_1").unwrap();
        assert!(store.get_edge("edge_1").unwrap().is_none());
        assert!(store.outgoing("msg_1").unwrap().is_empty());
        assert!(store.incoming("ent_1").unwrap().is_empty());
    }

    #[test]
    fn test_embedding_round_trip_and_search() {
        let (store, _temp) = open_temp(DatabaseKind::Embeddings);

        let mut vector = vec![0.0f32; 384];
        vector[3] = 1.0;
        let embedding = Embedding {
            id: Embedding::id_for(Resolution::Fast384, &NodeId::new("msg_1")),
            source_id: NodeId::new("msg_1"),
            resolution: Resolution::Fast384,
            vector: vector.clone(),
            model_version: "fast-v1".to_string(),
        };
        store.insert_embedding(&embedding).unwrap();

        let retrieved = store.get_embedding("emb:fast:msg_1").unwrap().unwrap();
        assert_eq!(retrieved.vector.len(), 384);
        assert_eq!(retrieved.source_id.as_str(), "msg_1");

        let hits = store
            .search_vectors(Resolution::Fast384, &vector, 5, 50)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_str(), "emb:fast:msg_1");

        store.delete_embedding("emb:fast:msg_1").unwrap();
        assert!(store.get_embedding("emb:fast:msg_1").unwrap().is_none());
        assert!(store
            .search_vectors(Resolution::Fast384, &vector, 5, 50)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db");
        {
            let store = StorageManager::open(
                &path,
                DatabaseKind::Conversations,
                Some(TemperatureTier::Active),
                HnswConfig::default(),
                None,
            )
            .unwrap();
            store.insert_node(&test_chat("persist_chat")).unwrap();
            store.sync().unwrap();
        }
        {
            let store = StorageManager::open(
                &path,
                DatabaseKind::Conversations,
                Some(TemperatureTier::Active),
                HnswConfig::default(),
                None,
            )
            .unwrap();
            let chat = store.get_node("persist_chat").unwrap();
            assert!(chat.is_some());
            // Structural index survives too.
            assert_eq!(
                store.nodes_by_property("node_type", "Chat").unwrap().len(),
                1
            );
        }
    }
}
