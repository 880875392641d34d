//! Associative linker module - connects entities that co-occur.
//!
//! Periodically scans MENTIONS edges inside a rolling window; entity pairs
//! that share enough messages get a RELATED_TO edge weighted by a PMI-like
//! score. Edge ids are deterministic per pair, so re-running the scan
//! updates weights instead of duplicating links.

use std::collections::HashMap;

use common::models::{relation, Edge};
use common::{EdgeId, NodeId};
use tokio_util::sync::CancellationToken;

use crate::{WeaverContext, WeaverError, WeaverResult};

/// Minimum shared messages before a pair is linked.
const MIN_CO_OCCURRENCE: usize = 2;

/// Deterministic edge id for an unordered entity pair.
fn pair_edge_id(a: &NodeId, b: &NodeId) -> (EdgeId, NodeId, NodeId) {
    let (first, second) = if a.as_str() <= b.as_str() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    };
    (
        EdgeId::new(format!("rel:{first}:{second}")),
        first,
        second,
    )
}

/// Scans the recent mention graph and writes RELATED_TO edges.
///
/// Returns the number of associative links created or refreshed.
pub async fn run(
    context: &WeaverContext,
    window_ms: i64,
    cancel: &CancellationToken,
) -> WeaverResult<usize> {
    let cutoff = common::now_ms().saturating_sub(window_ms);
    let knowledge = context.coordinator.knowledge_active();

    // message -> entities mentioned in it, within the window.
    let mut mentions_by_message: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in knowledge.iter_edges()? {
        if edge.relation_type != relation::MENTIONS || edge.created_at < cutoff {
            continue;
        }
        mentions_by_message
            .entry(edge.from_node.clone())
            .or_default()
            .push(edge.to_node.clone());
    }

    // Pair co-occurrence and per-entity message frequency.
    let mut pair_counts: HashMap<(NodeId, NodeId), usize> = HashMap::new();
    let mut entity_counts: HashMap<NodeId, usize> = HashMap::new();
    let total_messages = mentions_by_message.len().max(1);

    for entities in mentions_by_message.values() {
        let mut unique = entities.clone();
        unique.sort();
        unique.dedup();

        for entity in &unique {
            *entity_counts.entry(entity.clone()).or_insert(0) += 1;
        }
        for i in 0..unique.len() {
            for j in (i + 1)..unique.len() {
                let key = (unique[i].clone(), unique[j].clone());
                *pair_counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    let mut linked = 0;
    for ((a, b), co_count) in pair_counts {
        if cancel.is_cancelled() {
            return Err(WeaverError::Cancelled);
        }
        if co_count < MIN_CO_OCCURRENCE {
            continue;
        }

        // Pointwise mutual information, squashed into (0, 1].
        let p_ab = co_count as f64 / total_messages as f64;
        let p_a = entity_counts[&a] as f64 / total_messages as f64;
        let p_b = entity_counts[&b] as f64 / total_messages as f64;
        let pmi = (p_ab / (p_a * p_b)).ln().max(0.0);
        let weight = (1.0 - (-pmi).exp()).max(0.05) as f32;

        let (edge_id, from, to) = pair_edge_id(&a, &b);
        context.coordinator.insert_edge(Edge {
            id: edge_id,
            from_node: from,
            to_node: to,
            relation_type: relation::RELATED_TO.to_string(),
            weight,
            source_message_id: None,
            created_at: common::now_ms(),
            metadata: serde_json::json!({ "co_occurrences": co_count }),
        })?;
        linked += 1;
    }

    if linked > 0 {
        log::info!("associative linker refreshed {linked} RELATED_TO edges");
    }
    Ok(linked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_edge_id_is_order_independent() {
        let a = NodeId::new("ent_a");
        let b = NodeId::new("ent_b");
        let (id1, from1, _) = pair_edge_id(&a, &b);
        let (id2, from2, _) = pair_edge_id(&b, &a);
        assert_eq!(id1, id2);
        assert_eq!(from1, from2);
    }
}
