//! Common types and utilities shared across the memory-core crates.
//!
//! This crate provides foundational types, type aliases, and error definitions
//! that are used by every other crate in the workspace (mdbx-base, storage,
//! indexing, query, ...).
//!
//! # Architecture
//!
//! The `common` crate sits at the bottom of the dependency hierarchy:
//! - Has NO dependencies on other workspace crates
//! - Provides shared types that all other crates can use
//! - Ensures type consistency across the entire system

pub mod bridge;
pub mod config;
pub mod models;

// --- Id Newtypes ---

/// Generates a string-backed id newtype.
///
/// The three id kinds share one layout but stay distinct types, so a
/// `NodeId` can never be passed where an `EdgeId` belongs.
macro_rules! id_type {
    ($(#[$docs:meta])+ $name:ident) => {
        $(#[$docs])+
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw string id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrows the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Unwraps into the raw string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

id_type! {
    /// Identifies a node in the memory graph: a chat, message, entity,
    /// summary, tool result, action outcome, feedback record, or pattern.
    NodeId
}

id_type! {
    /// Identifies a directed edge between two nodes (e.g. MENTIONS,
    /// RELATED_TO).
    EdgeId
}

id_type! {
    /// Identifies a vector embedding. Embedding ids are deterministic per
    /// `(resolution, source)` pair, see `models::Embedding::id_for`.
    EmbeddingId
}

// --- Error Types ---

/// Common error type for all memory-core operations.
///
/// These are the kinds that cross the public API boundary. The KV layer
/// (`mdbx-base`) has its own finer-grained error enum that converts into
/// this one.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Requested entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write conflicts with existing state (e.g. append-only violation).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistent data failed validation; the affected table or tier
    /// needs recovery.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// The environment map is full and could not be grown.
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// The environment or resource is locked or otherwise unavailable.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled cooperatively.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A deadline elapsed before the operation completed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid operation or arguments.
    #[error("Invalid operation: {0}")]
    Invalid(String),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors (e.g. lock poisoning, ML bridge failures).
    #[error("{0}")]
    Other(String),
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type alias for memory-core operations.
pub type DbResult<T> = Result<T, DbError>;

// --- Metadata Sidecar Codec ---

/// Codec for the flexible metadata sidecar of the hybrid schema.
///
/// Entity records keep their typed core in fixed layout and carry the
/// free-form `serde_json::Value` sidecar as an opaque, length-prefixed byte
/// blob (the JSON rendering). Indexes never look inside it, and the binary
/// row format stays independent of the sidecar's shape. Attach with
/// `#[serde(with = "common::json_blob")]`.
pub mod json_blob {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Renders the sidecar to JSON bytes inside the surrounding row encoding.
    pub fn serialize<S>(value: &serde_json::Value, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_json::to_vec(value)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    /// Parses the sidecar back out of its byte blob.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        serde_json::from_slice(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_types() {
        let node_id = NodeId::new("node_123");
        let edge_id = EdgeId::new("edge_456");
        let embedding_id = EmbeddingId::new("embed_789");

        assert_eq!(node_id.as_str(), "node_123");
        assert_eq!(edge_id.as_str(), "edge_456");
        assert_eq!(embedding_id.as_str(), "embed_789");

        assert_eq!(node_id.to_string(), "node_123");
        assert_eq!(node_id.clone().into_inner(), "node_123");

        let from_string: NodeId = "test".to_string().into();
        let from_str: NodeId = "test".into();
        assert_eq!(from_string, from_str);
    }

    #[test]
    fn test_json_blob_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Row {
            key: u32,
            #[serde(with = "crate::json_blob")]
            sidecar: serde_json::Value,
        }

        let row = Row {
            key: 7,
            sidecar: serde_json::json!({"nested": {"list": [1, 2, 3]}, "unicode": "世界"}),
        };
        let bytes = bincode::serialize(&row).expect("serialize");
        let back: Row = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(back.key, 7);
        assert_eq!(back.sidecar["nested"]["list"][2], 3);
        assert_eq!(back.sidecar["unicode"], "世界");
    }

    #[test]
    fn test_error_display() {
        let err = DbError::NotFound("test_id".to_string());
        assert_eq!(err.to_string(), "Not found: test_id");

        let err = DbError::Invalid("test operation".to_string());
        assert_eq!(err.to_string(), "Invalid operation: test operation");
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // after Sep 2020
    }
}
