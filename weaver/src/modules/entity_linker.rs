//! Entity linker module - extracts and links named entities.
//!
//! Runs NER over message text, upserts `Entity` nodes into the knowledge
//! tiers, and records a MENTIONS edge per extraction. Mention counts drive
//! tier promotion (inferred -> active -> stable).

use common::models::{relation, Edge};
use common::{EdgeId, NodeId};
use tokio_util::sync::CancellationToken;

use crate::{WeaverContext, WeaverError, WeaverResult};

/// Extracts entities from one message and links them into the graph.
pub async fn run(
    context: &WeaverContext,
    message_id: &NodeId,
    text: &str,
    cancel: &CancellationToken,
) -> WeaverResult<()> {
    if text.trim().is_empty() {
        return Ok(());
    }

    let extracted = context
        .bridge
        .extract_entities(text)
        .await
        .map_err(|e| WeaverError::MlInference(e.to_string()))?;
    if extracted.is_empty() {
        return Ok(());
    }

    log::debug!("found {} entities in {message_id}", extracted.len());

    for extraction in extracted {
        if cancel.is_cancelled() {
            return Err(WeaverError::Cancelled);
        }

        let entity = context.coordinator.record_entity_mention(
            &extraction.text,
            &extraction.label,
            extraction.confidence,
            common::now_ms(),
        )?;
        link_mention(context, message_id, &entity.id, extraction.confidence)?;
        context.coordinator.promote_entity(entity.id.as_str())?;
    }

    Ok(())
}

/// Records a MENTIONS edge from the message to the entity, once per pair.
fn link_mention(
    context: &WeaverContext,
    message_id: &NodeId,
    entity_id: &NodeId,
    confidence: f32,
) -> WeaverResult<()> {
    let knowledge = context.coordinator.knowledge_active();

    // One MENTIONS edge per (message, entity) pair.
    for (edge_id, target) in knowledge.outgoing(message_id.as_str())? {
        if &target == entity_id {
            if let Some(edge) = knowledge.get_edge(edge_id.as_str())? {
                if edge.relation_type == relation::MENTIONS {
                    return Ok(());
                }
            }
        }
    }

    let edge = Edge {
        id: EdgeId::new(format!("edge_{}", uuid::Uuid::new_v4())),
        from_node: message_id.clone(),
        to_node: entity_id.clone(),
        relation_type: relation::MENTIONS.to_string(),
        weight: confidence,
        source_message_id: Some(message_id.clone()),
        created_at: common::now_ms(),
        metadata: serde_json::json!({}),
    };
    context.coordinator.insert_edge(edge)?;
    Ok(())
}

/// Re-derives an entity's mention count from its incoming MENTIONS edges.
/// Used by tests and the reconcile path.
pub fn mention_count(context: &WeaverContext, entity_id: &str) -> WeaverResult<u64> {
    let knowledge = context.coordinator.knowledge_active();
    let mut count = 0;
    for (edge_id, _) in knowledge.incoming(entity_id)? {
        if let Some(edge) = knowledge.get_edge(edge_id.as_str())? {
            if edge.relation_type == relation::MENTIONS {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Whether a node type carries entity-bearing text.
pub fn should_extract(node_type: &str) -> bool {
    matches!(node_type, "Message" | "Summary" | "ToolResult")
}
