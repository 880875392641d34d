//! Structural indexes for property-based queries.
//!
//! A B-tree mapping `(property_name, value)` to a sorted set of node ids,
//! enabling fast filtering without full table scans. The backing table lives
//! in the same environment as the node table it indexes, and mutations go
//! through the caller's write transaction so index and data commit together.
//!
//! # Key Format
//!
//! ```text
//! "prop:{property_name}:{value}" -> sorted Vec<node_id>
//! ```
//!
//! Values are strings; numeric properties (timestamps) are zero-padded via
//! [`encode_i64`] so lexicographic key order matches numeric order and range
//! scans work off the B-tree directly.

use common::{DbResult, NodeId};
use mdbx_base::{KvEnv, KvWriteTxn};

use crate::config::tables;

fn index_key(property: &str, value: &str) -> Vec<u8> {
    format!("prop:{property}:{value}").into_bytes()
}

fn property_prefix(property: &str) -> Vec<u8> {
    format!("prop:{property}:").into_bytes()
}

/// Encodes a non-negative i64 so lexicographic order equals numeric order.
pub fn encode_i64(value: i64) -> String {
    format!("{:020}", value.max(0))
}

fn decode_set(bytes: &[u8]) -> DbResult<Vec<String>> {
    bincode::deserialize(bytes).map_err(Into::into)
}

fn encode_set(ids: &[String]) -> DbResult<Vec<u8>> {
    bincode::serialize(ids).map_err(Into::into)
}

/// Adds a node id under `(property, value)` within the caller's transaction.
///
/// Adding an id that is already present is a no-op.
pub fn add(txn: &KvWriteTxn<'_>, property: &str, value: &str, node_id: &str) -> DbResult<()> {
    let key = index_key(property, value);
    let mut ids = match txn.get(tables::STRUCTURAL_INDEX, &key)? {
        Some(bytes) => decode_set(&bytes)?,
        None => Vec::new(),
    };

    match ids.binary_search_by(|probe| probe.as_str().cmp(node_id)) {
        Ok(_) => return Ok(()),
        Err(pos) => ids.insert(pos, node_id.to_string()),
    }

    txn.put(tables::STRUCTURAL_INDEX, &key, &encode_set(&ids)?)
}

/// Removes a node id from `(property, value)` within the caller's
/// transaction. Removing the last id drops the key entirely.
pub fn remove(txn: &KvWriteTxn<'_>, property: &str, value: &str, node_id: &str) -> DbResult<()> {
    let key = index_key(property, value);
    let Some(bytes) = txn.get(tables::STRUCTURAL_INDEX, &key)? else {
        return Ok(());
    };

    let mut ids = decode_set(&bytes)?;
    if let Ok(pos) = ids.binary_search_by(|probe| probe.as_str().cmp(node_id)) {
        ids.remove(pos);
        if ids.is_empty() {
            txn.delete(tables::STRUCTURAL_INDEX, &key)?;
        } else {
            txn.put(tables::STRUCTURAL_INDEX, &key, &encode_set(&ids)?)?;
        }
    }

    Ok(())
}

/// Retrieves all node ids for an exact `(property, value)` match.
pub fn get(env: &KvEnv, property: &str, value: &str) -> DbResult<Vec<NodeId>> {
    let key = index_key(property, value);
    match env.get(tables::STRUCTURAL_INDEX, &key)? {
        Some(bytes) => Ok(decode_set(&bytes)?.into_iter().map(NodeId::new).collect()),
        None => Ok(Vec::new()),
    }
}

/// Retrieves node ids for every value of `property` starting with
/// `value_prefix`.
pub fn get_prefix(env: &KvEnv, property: &str, value_prefix: &str) -> DbResult<Vec<NodeId>> {
    let prefix = index_key(property, value_prefix);
    let mut out = Vec::new();
    for (_, bytes) in env.scan_prefix(tables::STRUCTURAL_INDEX, &prefix)? {
        out.extend(decode_set(&bytes)?.into_iter().map(NodeId::new));
    }
    Ok(out)
}

/// Retrieves node ids whose encoded `property` value is within
/// `[low, high]` (inclusive, lexicographic on the encoded value).
pub fn get_range(env: &KvEnv, property: &str, low: &str, high: &str) -> DbResult<Vec<NodeId>> {
    let prefix = property_prefix(property);
    let mut out = Vec::new();
    for (key, bytes) in env.scan_prefix(tables::STRUCTURAL_INDEX, &prefix)? {
        let value = &key[prefix.len()..];
        if value >= low.as_bytes() && value <= high.as_bytes() {
            out.extend(decode_set(&bytes)?.into_iter().map(NodeId::new));
        }
    }
    Ok(out)
}

/// Number of nodes indexed under `(property, value)`.
pub fn count(env: &KvEnv, property: &str, value: &str) -> DbResult<usize> {
    let key = index_key(property, value);
    match env.get(tables::STRUCTURAL_INDEX, &key)? {
        Some(bytes) => Ok(decode_set(&bytes)?.len()),
        None => Ok(0),
    }
}

/// Deletes every entry of the structural index. Used before a rebuild.
pub fn clear(env: &KvEnv) -> DbResult<usize> {
    let keys: Vec<Vec<u8>> = env
        .scan_prefix(tables::STRUCTURAL_INDEX, b"")?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    let removed = keys.len();
    let txn = env.begin_write()?;
    for key in keys {
        txn.delete(tables::STRUCTURAL_INDEX, &key)?;
    }
    txn.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_env() -> (KvEnv, TempDir) {
        let temp = TempDir::new().unwrap();
        let env = KvEnv::open(&temp.path().join("idx"), 32).unwrap();
        env.ensure_table(tables::STRUCTURAL_INDEX).unwrap();
        (env, temp)
    }

    fn add_one(env: &KvEnv, property: &str, value: &str, node_id: &str) {
        let txn = env.begin_write().unwrap();
        add(&txn, property, value, node_id).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_add_and_get() {
        let (env, _temp) = create_test_env();

        add_one(&env, "chat_id", "chat_123", "msg_1");
        add_one(&env, "chat_id", "chat_123", "msg_2");
        add_one(&env, "chat_id", "chat_456", "msg_3");

        let results = get(&env, "chat_id", "chat_123").unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.contains(&NodeId::new("msg_1")));
        assert!(results.contains(&NodeId::new("msg_2")));

        let results = get(&env, "chat_id", "chat_456").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let (env, _temp) = create_test_env();

        add_one(&env, "chat_id", "chat_123", "msg_1");
        add_one(&env, "chat_id", "chat_123", "msg_1");

        let results = get(&env, "chat_id", "chat_123").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_remove_drops_empty_keys() {
        let (env, _temp) = create_test_env();

        add_one(&env, "chat_id", "chat_123", "msg_1");
        let txn = env.begin_write().unwrap();
        remove(&txn, "chat_id", "chat_123", "msg_1").unwrap();
        txn.commit().unwrap();

        assert_eq!(count(&env, "chat_id", "chat_123").unwrap(), 0);
        assert!(env
            .get(tables::STRUCTURAL_INDEX, b"prop:chat_id:chat_123")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_timestamp_range() {
        let (env, _temp) = create_test_env();

        add_one(&env, "timestamp", &encode_i64(1_000), "msg_early");
        add_one(&env, "timestamp", &encode_i64(5_000), "msg_mid");
        add_one(&env, "timestamp", &encode_i64(9_000), "msg_late");

        let hits = get_range(&env, "timestamp", &encode_i64(2_000), &encode_i64(8_000)).unwrap();
        assert_eq!(hits, vec![NodeId::new("msg_mid")]);

        let all = get_range(&env, "timestamp", &encode_i64(0), &encode_i64(10_000)).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_clear() {
        let (env, _temp) = create_test_env();

        add_one(&env, "node_type", "Message", "msg_1");
        add_one(&env, "node_type", "Chat", "chat_1");

        let removed = clear(&env).unwrap();
        assert_eq!(removed, 2);
        assert!(get(&env, "node_type", "Message").unwrap().is_empty());
    }
}
