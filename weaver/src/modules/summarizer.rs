//! Summarizer module - hierarchical memory consolidation.
//!
//! Groups the messages of a window by chat and asks the ML bridge for a
//! summary per chat. Summary ids are deterministic per (scope, chat,
//! window start), so a rescheduled run regenerates instead of duplicating.

use common::models::{Summary, SummaryScope};
use common::NodeId;
use tokio_util::sync::CancellationToken;

use crate::{WeaverContext, WeaverError, WeaverResult};

/// Summarizes all chats with activity inside `[start_ms, end_ms]`.
///
/// Returns the number of summaries written.
pub async fn run(
    context: &WeaverContext,
    scope: SummaryScope,
    start_ms: i64,
    end_ms: i64,
    cancel: &CancellationToken,
) -> WeaverResult<usize> {
    let conversations = context.coordinator.conversations_active();
    let chat_ids = conversations.nodes_by_property("node_type", "Chat")?;

    let mut written = 0;
    for chat_id in chat_ids {
        if cancel.is_cancelled() {
            return Err(WeaverError::Cancelled);
        }

        let messages = conversations.messages_by_chat(chat_id.as_str(), Some((start_ms, end_ms)))?;
        if messages.is_empty() {
            continue;
        }

        let texts: Vec<String> = messages.iter().map(|m| m.text_content.clone()).collect();
        let content = context
            .bridge
            .summarize(&texts)
            .await
            .map_err(|e| WeaverError::MlInference(e.to_string()))?;

        let summary = Summary {
            id: NodeId::new(format!("sum:{}:{}:{}", scope.name(), chat_id, start_ms)),
            scope,
            start_ts: start_ms,
            end_ts: end_ms,
            content,
            covered_message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            metadata: serde_json::json!({ "chat_id": chat_id.as_str() }),
        };
        context.coordinator.insert_summary(summary)?;
        written += 1;
    }

    if written > 0 {
        log::info!("summarizer wrote {written} {} summaries", scope.name());
    }
    Ok(written)
}

/// Parses a scope name coming from a task descriptor.
pub fn parse_scope(name: &str) -> Option<SummaryScope> {
    match name {
        "session" => Some(SummaryScope::Session),
        "daily" => Some(SummaryScope::Daily),
        "weekly" => Some(SummaryScope::Weekly),
        "monthly" => Some(SummaryScope::Monthly),
        _ => None,
    }
}
