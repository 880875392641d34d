//! Centralized configuration for the memory core.
//!
//! One struct carries every tunable; components receive it (or a copy) at
//! construction time instead of reading globals. The on-disk location of
//! the database set is part of the configuration too, resolved once at
//! startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the whole memory core.
///
/// Defaults match the documented production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root directory for every database environment. `None` falls back to
    /// the `MIA_DATA_DIR` environment variable, then the per-OS
    /// application-data directory (see [`CoreConfig::resolve_data_root`]).
    pub data_root: Option<PathBuf>,

    /// Days a chat stays in the `active` tier before demotion to `recent`.
    pub active_window_days: u32,
    /// Days before demotion from `recent` to `archive`.
    pub recent_window_days: u32,
    /// Maximum number of concurrently open tier environments.
    pub open_tier_cap: usize,

    /// HNSW: neighbors per node (M).
    pub hnsw_m: usize,
    /// HNSW: candidate-list size during construction.
    pub hnsw_ef_construction: usize,
    /// HNSW: default query-time breadth.
    pub hnsw_ef_search: usize,

    /// Dimension of the fast embedding model.
    pub embedding_dim_fast: usize,
    /// Dimension of the accurate embedding model.
    pub embedding_dim_accurate: usize,

    /// Worker counts per scheduler priority class.
    pub scheduler_workers_urgent: usize,
    pub scheduler_workers_normal: usize,
    pub scheduler_workers_low: usize,
    pub scheduler_workers_batch: usize,

    /// Seconds of idleness before LowActivity.
    pub activity_low_threshold_s: u64,
    /// Seconds of idleness before SleepMode.
    pub activity_sleep_threshold_s: u64,

    /// Per-query planning budget in milliseconds; plans estimated above this
    /// are narrowed before execution.
    pub query_budget_ms: u64,
    /// Hard query deadline in milliseconds; exceeded queries return partial
    /// results.
    pub query_deadline_ms: u64,

    /// Capacity of the bounded mutation-event channel.
    pub event_channel_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            active_window_days: 30,
            recent_window_days: 90,
            open_tier_cap: 16,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 50,
            embedding_dim_fast: 384,
            embedding_dim_accurate: 1536,
            scheduler_workers_urgent: 4,
            scheduler_workers_normal: 2,
            scheduler_workers_low: 1,
            scheduler_workers_batch: 1,
            activity_low_threshold_s: 30,
            activity_sleep_threshold_s: 600,
            query_budget_ms: 250,
            query_deadline_ms: 2000,
            event_channel_capacity: 4096,
        }
    }
}

impl CoreConfig {
    /// Milliseconds in the active window.
    pub fn active_window_ms(&self) -> i64 {
        self.active_window_days as i64 * 24 * 60 * 60 * 1000
    }

    /// Milliseconds in the recent window.
    pub fn recent_window_ms(&self) -> i64 {
        self.recent_window_days as i64 * 24 * 60 * 60 * 1000
    }

    /// Resolves where the database set lives.
    ///
    /// Precedence: the explicit `data_root` field, the `MIA_DATA_DIR`
    /// environment variable, then `<os app-data dir>/MIA/db` (APPDATA on
    /// Windows, Application Support on macOS, XDG data home elsewhere).
    pub fn resolve_data_root(&self) -> PathBuf {
        if let Some(root) = &self.data_root {
            return root.clone();
        }
        if let Some(dir) = std::env::var_os("MIA_DATA_DIR") {
            return PathBuf::from(dir);
        }

        let app_data = if cfg!(target_os = "windows") {
            std::env::var_os("APPDATA").map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join("Library").join("Application Support"))
        } else {
            std::env::var_os("XDG_DATA_HOME")
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var_os("HOME")
                        .map(|home| PathBuf::from(home).join(".local").join("share"))
                })
        };

        app_data
            .unwrap_or_else(|| PathBuf::from("."))
            .join("MIA")
            .join("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.active_window_days, 30);
        assert_eq!(config.recent_window_days, 90);
        assert_eq!(config.open_tier_cap, 16);
        assert_eq!(config.hnsw_m, 16);
        assert_eq!(config.hnsw_ef_construction, 200);
        assert_eq!(config.hnsw_ef_search, 50);
        assert_eq!(config.embedding_dim_fast, 384);
        assert_eq!(config.embedding_dim_accurate, 1536);
        assert_eq!(config.query_deadline_ms, 2000);
        assert_eq!(config.event_channel_capacity, 4096);
        assert!(config.data_root.is_none());
    }

    #[test]
    fn test_window_ms() {
        let config = CoreConfig::default();
        assert_eq!(config.active_window_ms(), 30 * 24 * 60 * 60 * 1000);
        assert!(config.recent_window_ms() > config.active_window_ms());
    }

    #[test]
    fn test_explicit_data_root_wins() {
        let config = CoreConfig {
            data_root: Some(PathBuf::from("/srv/mia-data")),
            ..CoreConfig::default()
        };
        assert_eq!(config.resolve_data_root(), PathBuf::from("/srv/mia-data"));
    }

    #[test]
    fn test_fallback_data_root_shape() {
        // Without an explicit root the path lands under the MIA app dir
        // (unless the environment overrides it wholesale).
        let config = CoreConfig::default();
        let root = config.resolve_data_root();
        if std::env::var_os("MIA_DATA_DIR").is_none() {
            assert!(root.ends_with(PathBuf::from("MIA").join("db")));
        }
    }
}
