//! Query performance stats, persisted into the meta database.
//!
//! Each executed query leaves one row; these train the meta-router and link
//! user feedback back to the query that earned it.

use common::{DbResult, NodeId};
use serde::{Deserialize, Serialize};
use storage::StorageManager;

/// Table holding one row per executed query.
pub const STATS_TABLE: &str = "performance_stats";

/// One query execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Row id; also the action-outcome id feedback references.
    pub id: String,
    /// Routing fingerprint of the query.
    pub fingerprint: String,
    /// When execution started (Unix milliseconds).
    pub started_at: i64,
    /// Wall time spent.
    pub wall_ms: u64,
    /// Stages actually touched, in order.
    pub stages: Vec<String>,
    /// Results returned.
    pub result_count: usize,
    /// Whether the query was cancelled mid-flight.
    pub cancelled: bool,
    /// Whether partial results were returned.
    pub incomplete: bool,
    /// Whether the plan was narrowed to fit the budget.
    pub downshifted: bool,
}

/// Persists one stats row in the meta environment.
pub fn record(meta: &StorageManager, stats: &PerformanceStats) -> DbResult<()> {
    let bytes = bincode::serialize(stats)?;
    meta.env().put(STATS_TABLE, stats.id.as_bytes(), &bytes)
}

/// Loads a stats row by id.
pub fn load(meta: &StorageManager, id: &str) -> DbResult<Option<PerformanceStats>> {
    match meta.env().get(STATS_TABLE, id.as_bytes())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Fresh stats id.
pub fn new_stats_id() -> NodeId {
    NodeId::new(format!("qstat_{}", uuid::Uuid::new_v4()))
}
