//! Knowledge Weaver - autonomous knowledge enrichment engine.
//!
//! The weaver listens for mutation events from storage and turns them into
//! scheduler tasks that enrich the memory:
//!
//! - Generating vector embeddings for semantic search (fast urgently,
//!   accurate in the background)
//! - Extracting and linking entities across conversations
//! - Creating associative links between co-occurring entities
//! - Summarizing conversations on schedule
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Storage (commit -> MutationEvent)     │
//! └──────────────┬──────────────────────────┘
//!                │ bounded channel
//!                ▼
//! ┌─────────────────────────────────────────┐
//! │     Weaver dispatcher (this crate)      │
//! │  events -> Task descriptors             │
//! │  dropped events -> backfill scan        │
//! └──────────────┬──────────────────────────┘
//!                │ submit
//!                ▼
//! ┌─────────────────────────────────────────┐
//! │  TaskScheduler (activity-gated pools)   │
//! └──────────────┬──────────────────────────┘
//!                │ execute
//!                ▼
//! ┌─────────────────────────────────────────┐
//! │  EnrichmentExecutor -> modules          │
//! │  • semantic_indexer  • entity_linker    │
//! │  • associative_linker • summarizer      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Per message id, modules observe events in storage-commit order (the
//! channel preserves emission order); cross-message ordering is not
//! guaranteed. Failures retry with backoff inside the scheduler and
//! dead-letter after the budget.

pub mod executor;
pub mod modules;

pub use executor::EnrichmentExecutor;

use std::sync::Arc;
use std::time::Duration;

use common::bridge::MlBridge;
use common::config::CoreConfig;
use common::DbError;
use embedding::EmbeddingPipeline;
use storage::{Coordinator, DatabaseKind, MutationEvent, MutationKind};
use task_scheduler::{Task, TaskScheduler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cadence of the periodic consolidation sweep.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Error type for weaver operations.
#[derive(Debug, thiserror::Error)]
pub enum WeaverError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// ML bridge error
    #[error("ML inference error: {0}")]
    MlInference(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// Cooperative cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Weaver is shutting down
    #[error("Weaver is shutting down")]
    ShuttingDown,
}

/// Result type for weaver operations.
pub type WeaverResult<T> = Result<T, WeaverError>;

/// Shared context for the enrichment modules.
pub struct WeaverContext {
    /// Coordinator owning every database.
    pub coordinator: Arc<Coordinator>,

    /// Embedding pipeline (chunking, pooling, persistence).
    pub pipeline: Arc<EmbeddingPipeline>,

    /// ML bridge for NER and summarization.
    pub bridge: Arc<dyn MlBridge>,

    /// Core configuration.
    pub config: CoreConfig,
}

impl WeaverContext {
    pub fn new(
        coordinator: Arc<Coordinator>,
        pipeline: Arc<EmbeddingPipeline>,
        bridge: Arc<dyn MlBridge>,
        config: CoreConfig,
    ) -> Self {
        Self {
            coordinator,
            pipeline,
            bridge,
            config,
        }
    }
}

/// The Knowledge Weaver engine: dispatches mutation events to the
/// scheduler.
pub struct Weaver {
    dispatcher: JoinHandle<()>,
}

impl Weaver {
    /// Spawns the dispatcher over the coordinator's event stream.
    ///
    /// On startup it runs a consistency pass: every message lacking a fast
    /// embedding is (re-)enqueued, which is how a crash between a source
    /// commit and its derived write heals.
    pub fn spawn(
        context: Arc<WeaverContext>,
        mut events: mpsc::Receiver<MutationEvent>,
        scheduler: Arc<TaskScheduler>,
    ) -> Weaver {
        let dispatcher = tokio::spawn(async move {
            if let Err(err) = Self::startup_backfill(&context, &scheduler).await {
                log::warn!("startup backfill failed: {err}");
            }

            let mut drop_check = tokio::time::interval(Duration::from_secs(5));
            let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
            maintenance.reset();
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(err) = Self::dispatch(&context, &scheduler, event).await {
                                    log::warn!("event dispatch failed: {err}");
                                }
                            }
                            None => {
                                log::info!("event channel closed, weaver dispatcher stopping");
                                break;
                            }
                        }
                    }
                    _ = drop_check.tick() => {
                        let dropped = context.coordinator.take_dropped_events();
                        if dropped > 0 {
                            log::warn!("{dropped} mutation events dropped; running backfill scan");
                            if let Err(err) = Self::startup_backfill(&context, &scheduler).await {
                                log::warn!("backfill failed: {err}");
                            }
                        }
                    }
                    _ = maintenance.tick() => {
                        if let Err(err) = Self::schedule_maintenance(&scheduler).await {
                            log::warn!("maintenance scheduling failed: {err}");
                        }
                    }
                }
            }
        });

        Weaver { dispatcher }
    }

    /// Enqueues the periodic consolidation set: associative linking,
    /// daily summarization, lifecycle demotion, and reconciliation.
    ///
    /// All four are Batch priority and run when the system sleeps. Skipped
    /// while the previous round is still queued, so an active user never
    /// piles up duplicates.
    async fn schedule_maintenance(scheduler: &TaskScheduler) -> WeaverResult<()> {
        if scheduler.queue_stats().await.batch_count > 0 {
            return Ok(());
        }

        let now = common::now_ms();
        let day_ms = 24 * 60 * 60 * 1000;
        let batch = [
            Task::LinkEntities { window_ms: day_ms },
            Task::Summarize {
                scope: "daily".to_string(),
                start_ms: now - day_ms,
                end_ms: now,
            },
            Task::DemoteChat { chat_id: None },
            Task::Reconcile,
        ];
        for task in batch {
            scheduler
                .submit(task)
                .await
                .map_err(|_| WeaverError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Translates one mutation event into scheduler tasks.
    async fn dispatch(
        context: &WeaverContext,
        scheduler: &TaskScheduler,
        event: MutationEvent,
    ) -> WeaverResult<()> {
        match (event.db, event.kind, event.node_type) {
            (DatabaseKind::Conversations, MutationKind::NodeInserted, Some("Message")) => {
                // Only messages currently in the active tier get enriched;
                // demotion re-emits inserts in cooler tiers.
                let Some(message) = lookup_active_message(context, &event.id)? else {
                    return Ok(());
                };
                let message_id = message.id.clone();
                let text = message.text_content;

                scheduler
                    .submit(Task::EmbedFast {
                        message_id: message_id.clone(),
                        text: text.clone(),
                    })
                    .await
                    .map_err(|_| WeaverError::ShuttingDown)?;
                scheduler
                    .submit(Task::EmbedAccurate {
                        message_id: message_id.clone(),
                        text: text.clone(),
                    })
                    .await
                    .map_err(|_| WeaverError::ShuttingDown)?;
                scheduler
                    .submit(Task::ExtractEntities { message_id, text })
                    .await
                    .map_err(|_| WeaverError::ShuttingDown)?;
            }
            (DatabaseKind::Knowledge, MutationKind::NodeInserted, Some("Entity")) => {
                scheduler
                    .submit(Task::PromoteEntity {
                        entity_id: common::NodeId::new(event.id),
                    })
                    .await
                    .map_err(|_| WeaverError::ShuttingDown)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Enqueues `EmbedFast` for every active message missing its fast
    /// embedding.
    async fn startup_backfill(
        context: &WeaverContext,
        scheduler: &TaskScheduler,
    ) -> WeaverResult<()> {
        let missing = context.coordinator.scan_missing_fast_embeddings()?;
        if missing.is_empty() {
            return Ok(());
        }
        log::info!("backfill: {} messages lack fast embeddings", missing.len());
        for (message_id, text) in missing {
            scheduler
                .submit(Task::EmbedFast { message_id, text })
                .await
                .map_err(|_| WeaverError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Stops the dispatcher.
    pub async fn shutdown(self) {
        self.dispatcher.abort();
        let _ = self.dispatcher.await;
    }
}

fn lookup_active_message(
    context: &WeaverContext,
    message_id: &str,
) -> WeaverResult<Option<common::models::Message>> {
    match context
        .coordinator
        .conversations_active()
        .get_node(message_id)?
    {
        Some(common::models::Node::Message(message)) => Ok(Some(message)),
        _ => Ok(None),
    }
}
