//! Task definitions.
//!
//! Tasks are descriptors: the scheduler owns queuing, gating, retries, and
//! cancellation, while execution is delegated to a [`TaskExecutor`]
//! implementation supplied by the enrichment layer.

use common::NodeId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::TaskPriority;

/// A background task that can be scheduled for execution.
#[derive(Debug, Clone)]
pub enum Task {
    /// Generate the fast (384-d) embedding for a message.
    EmbedFast { message_id: NodeId, text: String },

    /// Generate the accurate (1536-d) embedding for a message.
    EmbedAccurate { message_id: NodeId, text: String },

    /// Run NER over a message and upsert entities.
    ExtractEntities { message_id: NodeId, text: String },

    /// Scan recent entities and create associative RELATED_TO links.
    LinkEntities { window_ms: i64 },

    /// Produce a summary over a scope window.
    Summarize {
        scope: String,
        start_ms: i64,
        end_ms: i64,
    },

    /// Move an entity across knowledge tiers if its mentions warrant it.
    PromoteEntity { entity_id: NodeId },

    /// Demote chats past the active window (and their messages) to cooler
    /// tiers.
    DemoteChat { chat_id: Option<NodeId> },

    /// Truncate and rebuild the indexes of a database.
    RebuildIndex { database: String },

    /// Reconcile eventually consistent counters (entity mention counts).
    Reconcile,
}

impl Task {
    /// The default priority class for this task kind.
    pub fn priority(&self) -> TaskPriority {
        match self {
            Task::EmbedFast { .. } => TaskPriority::Urgent,
            Task::ExtractEntities { .. } => TaskPriority::Normal,
            Task::RebuildIndex { .. } => TaskPriority::Normal,
            Task::EmbedAccurate { .. } => TaskPriority::Low,
            Task::PromoteEntity { .. } => TaskPriority::Low,
            Task::LinkEntities { .. } => TaskPriority::Batch,
            Task::Summarize { .. } => TaskPriority::Batch,
            Task::DemoteChat { .. } => TaskPriority::Batch,
            Task::Reconcile => TaskPriority::Batch,
        }
    }

    /// Stable name for logging and stats.
    pub fn name(&self) -> &'static str {
        match self {
            Task::EmbedFast { .. } => "EmbedFast",
            Task::EmbedAccurate { .. } => "EmbedAccurate",
            Task::ExtractEntities { .. } => "ExtractEntities",
            Task::LinkEntities { .. } => "LinkEntities",
            Task::Summarize { .. } => "Summarize",
            Task::PromoteEntity { .. } => "PromoteEntity",
            Task::DemoteChat { .. } => "DemoteChat",
            Task::RebuildIndex { .. } => "RebuildIndex",
            Task::Reconcile => "Reconcile",
        }
    }
}

/// Error produced by task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task scheduler has shut down")]
    SchedulerShutdown,

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    Failed(String),
}

impl From<common::DbError> for TaskError {
    fn from(err: common::DbError) -> Self {
        match err {
            common::DbError::Cancelled(_) => TaskError::Cancelled,
            other => TaskError::Failed(other.to_string()),
        }
    }
}

/// Executes tasks on behalf of the scheduler.
///
/// Implementations check the cancellation token at safe points (between
/// chunks, between messages) and return `TaskError::Cancelled` when asked to
/// stop.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<(), TaskError>;
}

/// A task that failed its retry budget, kept queryable for diagnostics.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub task_name: &'static str,
    pub detail: String,
    pub error: String,
    pub attempts: u32,
    pub at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priorities() {
        let fast = Task::EmbedFast {
            message_id: NodeId::new("m"),
            text: String::new(),
        };
        assert_eq!(fast.priority(), TaskPriority::Urgent);

        let accurate = Task::EmbedAccurate {
            message_id: NodeId::new("m"),
            text: String::new(),
        };
        assert_eq!(accurate.priority(), TaskPriority::Low);

        assert_eq!(Task::Reconcile.priority(), TaskPriority::Batch);
        assert_eq!(Task::Reconcile.name(), "Reconcile");
    }
}
