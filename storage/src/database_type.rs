//! Database type system for the multi-tier memory architecture.
//!
//! This module defines the logical databases and temperature tiers that make
//! up the cognitive memory system, and where each lives on disk.

use std::path::{Path, PathBuf};

/// Durability class of a logical database.
///
/// The class decides the recovery story: SOURCE data is recoverable only
/// from backup, everything else regenerates, re-fetches, or rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurabilityClass {
    /// Critical user data; cannot be lost.
    Source,
    /// Regeneratable from SOURCE databases.
    Derived,
    /// Cached external data; re-fetch on miss.
    ExternalCache,
    /// Agent experience and feedback; critical for learning.
    Learning,
    /// Query optimization metadata; rebuildable from logs.
    Index,
    /// Downloaded model blobs; re-download.
    Assets,
    /// System events; lossy.
    Telemetry,
}

/// Logical databases in the memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    /// SOURCE: user conversations (chats, messages).
    Conversations,
    /// DERIVED: extracted entities and relationships.
    Knowledge,
    /// DERIVED: semantic embeddings and their HNSW indexes.
    Embeddings,
    /// DERIVED: hierarchical summaries.
    Summaries,
    /// EXTERNAL CACHE: searches, scraped pages, API responses.
    ToolResults,
    /// LEARNING: action outcomes, feedback, patterns.
    Experience,
    /// INDEX: query routing cache and performance stats.
    Meta,
    /// ASSETS: model files and manifests.
    ModelCache,
    /// TELEMETRY: lossy system-event ring.
    Logs,
}

impl DatabaseKind {
    /// Human-readable name, also the on-disk directory name.
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseKind::Conversations => "conversations",
            DatabaseKind::Knowledge => "knowledge",
            DatabaseKind::Embeddings => "embeddings",
            DatabaseKind::Summaries => "summaries",
            DatabaseKind::ToolResults => "tool-results",
            DatabaseKind::Experience => "experience",
            DatabaseKind::Meta => "meta",
            DatabaseKind::ModelCache => "model-cache",
            DatabaseKind::Logs => "logs",
        }
    }

    /// The durability class of this database.
    pub fn class(&self) -> DurabilityClass {
        match self {
            DatabaseKind::Conversations => DurabilityClass::Source,
            DatabaseKind::Knowledge
            | DatabaseKind::Embeddings
            | DatabaseKind::Summaries => DurabilityClass::Derived,
            DatabaseKind::ToolResults => DurabilityClass::ExternalCache,
            DatabaseKind::Experience => DurabilityClass::Learning,
            DatabaseKind::Meta => DurabilityClass::Index,
            DatabaseKind::ModelCache => DurabilityClass::Assets,
            DatabaseKind::Logs => DurabilityClass::Telemetry,
        }
    }

    /// Whether losing this database loses user data.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.class(),
            DurabilityClass::Source | DurabilityClass::Learning
        )
    }

    /// Whether this database regenerates from a SOURCE database.
    pub fn is_derived(&self) -> bool {
        self.class() == DurabilityClass::Derived
    }
}

/// Temperature tier of a physical partition.
///
/// A tier is a separate environment with the same schema, so compaction,
/// snapshotting, and corruption are isolated per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemperatureTier {
    /// 0..active_window days, always open, sub-millisecond reads.
    Active,
    /// active_window..recent_window days, lazy-opened, LRU-evicted.
    Recent,
    /// Older than recent_window, bucketed by quarter, opened on demand.
    Archive,
    /// Knowledge: proven important entities.
    Stable,
    /// Knowledge: experimental, low-confidence entities.
    Inferred,
    /// Summaries: current session.
    Session,
    /// Summaries: daily rollups.
    Daily,
    /// Summaries: weekly rollups.
    Weekly,
    /// Summaries: monthly rollups.
    Monthly,
}

impl TemperatureTier {
    /// Human-readable name, also the on-disk directory name.
    pub fn name(&self) -> &'static str {
        match self {
            TemperatureTier::Active => "active",
            TemperatureTier::Recent => "recent",
            TemperatureTier::Archive => "archive",
            TemperatureTier::Stable => "stable",
            TemperatureTier::Inferred => "inferred",
            TemperatureTier::Session => "session",
            TemperatureTier::Daily => "daily",
            TemperatureTier::Weekly => "weekly",
            TemperatureTier::Monthly => "monthly",
        }
    }

    /// Whether this tier is pinned open for the process lifetime.
    pub fn is_pinned(&self) -> bool {
        matches!(
            self,
            TemperatureTier::Active | TemperatureTier::Stable | TemperatureTier::Inferred
        )
    }
}

/// Identifies one physical environment: a database, its tier, and (for
/// archives) the time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TierAddress {
    pub kind: DatabaseKind,
    pub tier: Option<TemperatureTier>,
    /// Quarter bucket like `2024-Q4`; only meaningful with
    /// `TemperatureTier::Archive`.
    pub bucket: Option<String>,
}

impl TierAddress {
    pub fn new(kind: DatabaseKind, tier: Option<TemperatureTier>) -> Self {
        Self {
            kind,
            tier,
            bucket: None,
        }
    }

    pub fn archive(kind: DatabaseKind, bucket: impl Into<String>) -> Self {
        Self {
            kind,
            tier: Some(TemperatureTier::Archive),
            bucket: Some(bucket.into()),
        }
    }

    /// On-disk path of this environment under `root`.
    pub fn path(&self, root: &Path) -> PathBuf {
        let mut path = root.join(self.kind.name());
        if let Some(tier) = self.tier {
            path = path.join(tier.name());
        }
        if let Some(bucket) = &self.bucket {
            path = path.join(bucket);
        }
        path
    }
}

/// Quarter bucket (`YYYY-Qn`, UTC) for a millisecond timestamp.
pub fn bucket_for_timestamp(timestamp_ms: i64) -> String {
    use chrono::{DateTime, Datelike, Utc};
    let datetime = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).expect("epoch"));
    let quarter = datetime.month0() / 3 + 1;
    format!("{}-Q{}", datetime.year(), quarter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durability_classes() {
        assert_eq!(DatabaseKind::Conversations.class(), DurabilityClass::Source);
        assert!(DatabaseKind::Conversations.is_critical());
        assert!(DatabaseKind::Experience.is_critical());
        assert!(DatabaseKind::Knowledge.is_derived());
        assert!(DatabaseKind::Embeddings.is_derived());
        assert!(!DatabaseKind::ToolResults.is_derived());
        assert_eq!(DatabaseKind::Logs.class(), DurabilityClass::Telemetry);
    }

    #[test]
    fn test_tier_paths() {
        let root = Path::new("/data/mia");
        let active = TierAddress::new(DatabaseKind::Conversations, Some(TemperatureTier::Active));
        assert_eq!(
            active.path(root),
            Path::new("/data/mia/conversations/active")
        );

        let archive = TierAddress::archive(DatabaseKind::Conversations, "2024-Q4");
        assert_eq!(
            archive.path(root),
            Path::new("/data/mia/conversations/archive/2024-Q4")
        );

        let meta = TierAddress::new(DatabaseKind::Meta, None);
        assert_eq!(meta.path(root), Path::new("/data/mia/meta"));
    }

    #[test]
    fn test_bucket_for_timestamp() {
        // 2024-11-15 UTC
        let ts = 1_731_628_800_000;
        assert_eq!(bucket_for_timestamp(ts), "2024-Q4");

        // 2024-02-01 UTC
        let ts = 1_706_745_600_000;
        assert_eq!(bucket_for_timestamp(ts), "2024-Q1");
    }

    #[test]
    fn test_pinned_tiers() {
        assert!(TemperatureTier::Active.is_pinned());
        assert!(TemperatureTier::Stable.is_pinned());
        assert!(!TemperatureTier::Recent.is_pinned());
        assert!(!TemperatureTier::Archive.is_pinned());
    }
}
