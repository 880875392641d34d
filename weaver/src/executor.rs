//! The enrichment task executor.
//!
//! Bridges the scheduler to the weaver modules and the coordinator's
//! lifecycle operations: every scheduler [`Task`] kind dispatches here.

use std::sync::Arc;

use storage::DatabaseKind;
use task_scheduler::{Task, TaskError, TaskExecutor};
use tokio_util::sync::CancellationToken;

use crate::modules::{associative_linker, entity_linker, semantic_indexer, summarizer};
use crate::{WeaverContext, WeaverError};

/// Executes enrichment and lifecycle tasks on behalf of the scheduler.
pub struct EnrichmentExecutor {
    context: Arc<WeaverContext>,
}

impl EnrichmentExecutor {
    pub fn new(context: Arc<WeaverContext>) -> Self {
        Self { context }
    }
}

fn database_kind(name: &str) -> Option<DatabaseKind> {
    match name {
        "conversations" => Some(DatabaseKind::Conversations),
        "knowledge" => Some(DatabaseKind::Knowledge),
        "embeddings" => Some(DatabaseKind::Embeddings),
        "summaries" => Some(DatabaseKind::Summaries),
        "tool-results" => Some(DatabaseKind::ToolResults),
        "experience" => Some(DatabaseKind::Experience),
        "meta" => Some(DatabaseKind::Meta),
        _ => None,
    }
}

fn task_err(err: WeaverError) -> TaskError {
    match err {
        WeaverError::Cancelled => TaskError::Cancelled,
        other => TaskError::Failed(other.to_string()),
    }
}

#[async_trait::async_trait]
impl TaskExecutor for EnrichmentExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<(), TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let context = &self.context;

        match task {
            Task::EmbedFast { message_id, text } => {
                semantic_indexer::run_fast(context, message_id, text, cancel)
                    .await
                    .map_err(task_err)?;
            }
            Task::EmbedAccurate { message_id, text } => {
                semantic_indexer::run_accurate(context, message_id, text, cancel)
                    .await
                    .map_err(task_err)?;
            }
            Task::ExtractEntities { message_id, text } => {
                entity_linker::run(context, message_id, text, cancel)
                    .await
                    .map_err(task_err)?;
            }
            Task::LinkEntities { window_ms } => {
                associative_linker::run(context, *window_ms, cancel)
                    .await
                    .map_err(task_err)?;
            }
            Task::Summarize {
                scope,
                start_ms,
                end_ms,
            } => {
                let scope = summarizer::parse_scope(scope)
                    .ok_or_else(|| TaskError::Failed(format!("unknown scope '{scope}'")))?;
                summarizer::run(context, scope, *start_ms, *end_ms, cancel)
                    .await
                    .map_err(task_err)?;
            }
            Task::PromoteEntity { entity_id } => {
                context.coordinator.promote_entity(entity_id.as_str())?;
            }
            Task::DemoteChat { chat_id } => {
                let now = common::now_ms();
                match chat_id {
                    Some(id) => {
                        context.coordinator.demote_chat(id.as_str(), now)?;
                    }
                    None => {
                        context.coordinator.demote_expired_chats(now)?;
                    }
                }
            }
            Task::RebuildIndex { database } => {
                let kind = database_kind(database)
                    .ok_or_else(|| TaskError::Failed(format!("unknown database '{database}'")))?;
                context.coordinator.rebuild_indexes(kind)?;
            }
            Task::Reconcile => {
                let corrected = context.coordinator.reconcile_mentions()?;
                if corrected > 0 {
                    log::info!("reconciled {corrected} entity mention counts");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_kind_parsing() {
        assert_eq!(database_kind("knowledge"), Some(DatabaseKind::Knowledge));
        assert_eq!(database_kind("tool-results"), Some(DatabaseKind::ToolResults));
        assert_eq!(database_kind("model-cache"), None);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            task_err(WeaverError::Cancelled),
            TaskError::Cancelled
        ));
        assert!(matches!(
            task_err(WeaverError::MlInference("boom".to_string())),
            TaskError::Failed(_)
        ));
    }
}
