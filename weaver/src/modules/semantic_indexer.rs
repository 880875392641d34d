//! Semantic indexer module - generates vector embeddings for messages.
//!
//! Fast embeddings run urgently when a message lands; accurate embeddings
//! follow as low-priority background work.

use common::models::{Embedding, Resolution};
use common::NodeId;
use tokio_util::sync::CancellationToken;

use crate::{WeaverContext, WeaverError, WeaverResult};

/// Generates and stores the fast (384-d) embedding for a message.
///
/// Skips silently when the message has left the active tier (demoted while
/// queued) or already has a fast embedding.
pub async fn run_fast(
    context: &WeaverContext,
    message_id: &NodeId,
    text: &str,
    cancel: &CancellationToken,
) -> WeaverResult<()> {
    run_at(context, message_id, text, Resolution::Fast384, cancel).await
}

/// Generates and stores the accurate (1536-d) embedding for a message.
pub async fn run_accurate(
    context: &WeaverContext,
    message_id: &NodeId,
    text: &str,
    cancel: &CancellationToken,
) -> WeaverResult<()> {
    run_at(context, message_id, text, Resolution::Accurate1536, cancel).await
}

async fn run_at(
    context: &WeaverContext,
    message_id: &NodeId,
    text: &str,
    resolution: Resolution,
    cancel: &CancellationToken,
) -> WeaverResult<()> {
    if cancel.is_cancelled() {
        return Err(WeaverError::Cancelled);
    }
    if text.trim().is_empty() {
        log::debug!("no text content for {message_id}, skipping embedding");
        return Ok(());
    }

    // Demoted while queued: its embedding moved with it.
    if context
        .coordinator
        .conversations_active()
        .get_node(message_id.as_str())?
        .is_none()
    {
        log::debug!("message {message_id} left the active tier, skipping");
        return Ok(());
    }

    let embedding_id = Embedding::id_for(resolution, message_id);
    if context
        .coordinator
        .embeddings_active()
        .get_embedding(embedding_id.as_str())?
        .is_some()
    {
        log::debug!("{message_id} already has a {} embedding", resolution.tag());
        return Ok(());
    }

    let store = context.coordinator.embeddings_active();
    match resolution {
        Resolution::Fast384 => context.pipeline.embed_fast(&store, text, message_id).await?,
        Resolution::Accurate1536 => {
            context
                .pipeline
                .embed_accurate(&store, text, message_id)
                .await?
        }
    };

    log::debug!("embedded {message_id} at {}", resolution.tag());
    Ok(())
}
