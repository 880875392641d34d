//! Graph indexes for relationship traversal.
//!
//! Two adjacency tables give O(1) amortized neighbor lookup in either
//! direction. Inserting or deleting an edge updates both tables inside the
//! caller's write transaction, so the pair can never diverge.
//!
//! # Key Formats
//!
//! ```text
//! Outgoing: "out:{node_id}" -> sorted Vec<(edge_id, target_id)>
//! Incoming: "in:{node_id}"  -> sorted Vec<(edge_id, source_id)>
//! ```

use common::models::Edge;
use common::{DbResult, EdgeId, NodeId};
use mdbx_base::{KvEnv, KvWriteTxn};

use crate::config::tables;

/// One adjacency entry: the edge id and the node on the other end.
pub type Neighbor = (EdgeId, NodeId);

fn out_key(node_id: &str) -> Vec<u8> {
    format!("out:{node_id}").into_bytes()
}

fn in_key(node_id: &str) -> Vec<u8> {
    format!("in:{node_id}").into_bytes()
}

fn decode(bytes: &[u8]) -> DbResult<Vec<(String, String)>> {
    bincode::deserialize(bytes).map_err(Into::into)
}

fn encode(entries: &[(String, String)]) -> DbResult<Vec<u8>> {
    bincode::serialize(entries).map_err(Into::into)
}

fn add_entry(
    txn: &KvWriteTxn<'_>,
    table: &str,
    key: &[u8],
    edge_id: &str,
    peer_id: &str,
) -> DbResult<()> {
    let mut entries = match txn.get(table, key)? {
        Some(bytes) => decode(&bytes)?,
        None => Vec::new(),
    };

    match entries.binary_search_by(|(e, _)| e.as_str().cmp(edge_id)) {
        Ok(_) => return Ok(()),
        Err(pos) => entries.insert(pos, (edge_id.to_string(), peer_id.to_string())),
    }

    txn.put(table, key, &encode(&entries)?)
}

fn remove_entry(txn: &KvWriteTxn<'_>, table: &str, key: &[u8], edge_id: &str) -> DbResult<()> {
    let Some(bytes) = txn.get(table, key)? else {
        return Ok(());
    };

    let mut entries = decode(&bytes)?;
    if let Ok(pos) = entries.binary_search_by(|(e, _)| e.as_str().cmp(edge_id)) {
        entries.remove(pos);
        if entries.is_empty() {
            txn.delete(table, key)?;
        } else {
            txn.put(table, key, &encode(&entries)?)?;
        }
    }

    Ok(())
}

/// Adds an edge to both adjacency tables within the caller's transaction.
pub fn add_edge(txn: &KvWriteTxn<'_>, edge: &Edge) -> DbResult<()> {
    add_entry(
        txn,
        tables::GRAPH_OUTGOING,
        &out_key(edge.from_node.as_str()),
        edge.id.as_str(),
        edge.to_node.as_str(),
    )?;
    add_entry(
        txn,
        tables::GRAPH_INCOMING,
        &in_key(edge.to_node.as_str()),
        edge.id.as_str(),
        edge.from_node.as_str(),
    )
}

/// Removes an edge from both adjacency tables within the caller's
/// transaction.
pub fn remove_edge(txn: &KvWriteTxn<'_>, edge: &Edge) -> DbResult<()> {
    remove_entry(
        txn,
        tables::GRAPH_OUTGOING,
        &out_key(edge.from_node.as_str()),
        edge.id.as_str(),
    )?;
    remove_entry(
        txn,
        tables::GRAPH_INCOMING,
        &in_key(edge.to_node.as_str()),
        edge.id.as_str(),
    )
}

fn read_neighbors(env: &KvEnv, table: &str, key: &[u8]) -> DbResult<Vec<Neighbor>> {
    match env.get(table, key)? {
        Some(bytes) => Ok(decode(&bytes)?
            .into_iter()
            .map(|(e, n)| (EdgeId::new(e), NodeId::new(n)))
            .collect()),
        None => Ok(Vec::new()),
    }
}

/// Outgoing `(edge_id, target_id)` pairs for a node.
pub fn outgoing(env: &KvEnv, node_id: &str) -> DbResult<Vec<Neighbor>> {
    read_neighbors(env, tables::GRAPH_OUTGOING, &out_key(node_id))
}

/// Incoming `(edge_id, source_id)` pairs for a node.
pub fn incoming(env: &KvEnv, node_id: &str) -> DbResult<Vec<Neighbor>> {
    read_neighbors(env, tables::GRAPH_INCOMING, &in_key(node_id))
}

/// Count of outgoing edges.
pub fn count_outgoing(env: &KvEnv, node_id: &str) -> DbResult<usize> {
    Ok(outgoing(env, node_id)?.len())
}

/// Count of incoming edges.
pub fn count_incoming(env: &KvEnv, node_id: &str) -> DbResult<usize> {
    Ok(incoming(env, node_id)?.len())
}

/// Deletes both adjacency tables. Used before a rebuild.
pub fn clear(env: &KvEnv) -> DbResult<usize> {
    let mut removed = 0;
    for table in [tables::GRAPH_OUTGOING, tables::GRAPH_INCOMING] {
        let keys: Vec<Vec<u8>> = env
            .scan_prefix(table, b"")?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        removed += keys.len();
        let txn = env.begin_write()?;
        for key in keys {
            txn.delete(table, &key)?;
        }
        txn.commit()?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_env() -> (KvEnv, TempDir) {
        let temp = TempDir::new().unwrap();
        let env = KvEnv::open(&temp.path().join("graph"), 32).unwrap();
        env.ensure_table(tables::GRAPH_OUTGOING).unwrap();
        env.ensure_table(tables::GRAPH_INCOMING).unwrap();
        (env, temp)
    }

    fn test_edge(id: &str, from: &str, to: &str) -> Edge {
        Edge {
            id: EdgeId::new(id),
            from_node: NodeId::new(from),
            to_node: NodeId::new(to),
            relation_type: "MENTIONS".to_string(),
            weight: 1.0,
            source_message_id: None,
            created_at: 1697500000000,
            metadata: json!({}),
        }
    }

    #[test]
    fn test_add_edge_updates_both_directions() {
        let (env, _temp) = create_test_env();
        let edge = test_edge("edge_1", "msg_1", "entity_rust");

        let txn = env.begin_write().unwrap();
        add_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        let out = outgoing(&env, "msg_1").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.as_str(), "edge_1");
        assert_eq!(out[0].1.as_str(), "entity_rust");

        let inc = incoming(&env, "entity_rust").unwrap();
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].1.as_str(), "msg_1");
    }

    #[test]
    fn test_remove_edge_removes_both_directions() {
        let (env, _temp) = create_test_env();
        let edge = test_edge("edge_1", "a", "b");

        let txn = env.begin_write().unwrap();
        add_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        let txn = env.begin_write().unwrap();
        remove_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        assert!(outgoing(&env, "a").unwrap().is_empty());
        assert!(incoming(&env, "b").unwrap().is_empty());
    }

    #[test]
    fn test_multiple_edges_per_node() {
        let (env, _temp) = create_test_env();

        let txn = env.begin_write().unwrap();
        add_edge(&txn, &test_edge("edge_1", "msg_1", "ent_a")).unwrap();
        add_edge(&txn, &test_edge("edge_2", "msg_1", "ent_b")).unwrap();
        add_edge(&txn, &test_edge("edge_3", "msg_2", "ent_a")).unwrap();
        txn.commit().unwrap();

        assert_eq!(count_outgoing(&env, "msg_1").unwrap(), 2);
        assert_eq!(count_incoming(&env, "ent_a").unwrap(), 2);
        assert_eq!(count_incoming(&env, "ent_b").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let (env, _temp) = create_test_env();
        let edge = test_edge("edge_1", "a", "b");

        let txn = env.begin_write().unwrap();
        add_edge(&txn, &edge).unwrap();
        add_edge(&txn, &edge).unwrap();
        txn.commit().unwrap();

        assert_eq!(count_outgoing(&env, "a").unwrap(), 1);
    }
}
