//! Stage 0: meta routing.
//!
//! The planner consults the routing cache for similar past queries, widens
//! the plan when prior feedback says results missed the mark, and narrows
//! it when the cost estimate blows the budget. Every decision is recorded
//! back so the router learns.

use common::config::CoreConfig;
use common::models::FeedbackType;
use common::DbResult;
use serde::{Deserialize, Serialize};
use storage::{Coordinator, DatabaseKind};

use crate::models::{Query, QueryContext, QueryPlan, Temperature};

/// Table mapping query fingerprints to their last plan and cost.
pub const ROUTING_TABLE: &str = "routing_cache";

/// Cached routing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub fingerprint: String,
    pub max_depth: usize,
    pub use_knowledge_graph: bool,
    pub last_cost_ms: u64,
    pub hits: u64,
    /// Stats id of the query execution this entry last learned from.
    pub learned_from: Option<String>,
}

/// Routing fingerprint: normalized semantic terms plus the scope shape.
///
/// Word order is dropped so paraphrases with identical vocabulary route the
/// same way.
pub fn fingerprint(query: &Query) -> String {
    let mut words: Vec<String> = query
        .semantic
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();
    words.sort();
    words.dedup();

    let context_tag = match &query.context {
        QueryContext::CurrentChat(id) => format!("chat:{id}"),
        QueryContext::AllChats => "all".to_string(),
        QueryContext::RelatedChats(id) => format!("related:{id}"),
        QueryContext::ByTopic(ids) => format!("topic:{}", ids.len()),
    };

    format!("{}|{}", words.join("+"), context_tag)
}

fn tiers_for(coordinator: &Coordinator, temperature: Temperature) -> Vec<String> {
    let mut tiers = Vec::new();
    match temperature {
        Temperature::Hot => tiers.push("active".to_string()),
        Temperature::Warm => {
            tiers.push("active".to_string());
            tiers.push("recent".to_string());
        }
        Temperature::Cold => {
            tiers.extend(coordinator.archive_buckets(DatabaseKind::Conversations));
        }
        Temperature::All => {
            tiers.push("active".to_string());
            tiers.push("recent".to_string());
            tiers.extend(coordinator.archive_buckets(DatabaseKind::Conversations));
        }
    }
    tiers
}

fn estimate_cost_ms(tiers: usize, depth: usize, use_graph: bool, limit: usize) -> f64 {
    // Per-tier open + scan cost dominates; graph expansion scales with depth.
    let tier_cost = tiers as f64 * 25.0;
    let graph_cost = if use_graph {
        40.0 + depth as f64 * 35.0
    } else {
        0.0
    };
    let rank_cost = (limit as f64).sqrt() * 5.0;
    10.0 + tier_cost + graph_cost + rank_cost
}

/// Builds the plan for a query, consulting meta-memory.
pub fn plan(coordinator: &Coordinator, config: &CoreConfig, query: &Query) -> DbResult<QueryPlan> {
    let fp = fingerprint(query);
    let mut max_depth = query.search_depth.hops();
    let mut use_graph = query.use_knowledge_graph;
    let mut informed = false;

    // Cached routing for this fingerprint.
    if let Some(entry) = load_entry(coordinator, &fp)? {
        if entry.use_knowledge_graph && !use_graph {
            use_graph = true;
            max_depth = max_depth.max(entry.max_depth.max(1));
            informed = true;
        }
    }

    // Prior corrections on this fingerprint widen the plan: the narrow run
    // missed what the user wanted.
    if correction_on_record(coordinator, &fp)? {
        use_graph = true;
        max_depth = max_depth.max(1);
        informed = true;
    }

    let mut temperature = query.temperature;
    let mut tiers = tiers_for(coordinator, temperature);
    let mut cost = estimate_cost_ms(tiers.len(), max_depth, use_graph, query.limit);
    let mut downshifted = false;

    // Budget downshift: narrow temperature, then depth, until it fits.
    while cost > config.query_budget_ms as f64 {
        if matches!(temperature, Temperature::All | Temperature::Cold) {
            temperature = Temperature::Warm;
        } else if temperature == Temperature::Warm {
            temperature = Temperature::Hot;
        } else if max_depth > 1 {
            max_depth -= 1;
        } else if use_graph && max_depth > 0 {
            max_depth = 0;
        } else {
            break;
        }
        downshifted = true;
        tiers = tiers_for(coordinator, temperature);
        cost = estimate_cost_ms(tiers.len(), max_depth, use_graph, query.limit);
    }

    let mut databases = vec!["conversations".to_string(), "embeddings".to_string()];
    if use_graph {
        databases.push("knowledge".to_string());
    }
    databases.push("experience".to_string());

    Ok(QueryPlan {
        tiers_to_open: tiers,
        databases_to_scan: databases,
        max_depth,
        use_knowledge_graph: use_graph,
        estimated_cost_ms: cost,
        downshifted,
        informed_by_meta: informed,
    })
}

/// Records the executed plan and its measured cost into the routing cache.
pub fn record_outcome(
    coordinator: &Coordinator,
    fp: &str,
    plan: &QueryPlan,
    actual_ms: u64,
    stats_id: &str,
) -> DbResult<()> {
    let mut entry = load_entry(coordinator, fp)?.unwrap_or(RoutingEntry {
        fingerprint: fp.to_string(),
        max_depth: plan.max_depth,
        use_knowledge_graph: plan.use_knowledge_graph,
        last_cost_ms: actual_ms,
        hits: 0,
        learned_from: None,
    });
    entry.max_depth = plan.max_depth;
    entry.use_knowledge_graph = plan.use_knowledge_graph;
    entry.last_cost_ms = actual_ms;
    entry.hits += 1;
    entry.learned_from = Some(stats_id.to_string());

    let bytes = bincode::serialize(&entry)?;
    coordinator
        .meta()
        .env()
        .put(ROUTING_TABLE, fp.as_bytes(), &bytes)
}

/// Loads a routing entry.
pub fn load_entry(coordinator: &Coordinator, fp: &str) -> DbResult<Option<RoutingEntry>> {
    match coordinator.meta().env().get(ROUTING_TABLE, fp.as_bytes())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Whether a prior query with this fingerprint drew a Correction.
fn correction_on_record(coordinator: &Coordinator, fp: &str) -> DbResult<bool> {
    for outcome in coordinator.recent_outcomes("query", 32)? {
        if outcome.action_args.get("fingerprint").and_then(|v| v.as_str()) != Some(fp) {
            continue;
        }
        for feedback in coordinator.feedback_for_outcome(outcome.id.as_str())? {
            if feedback.feedback == FeedbackType::Correction {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchDepth;
    use storage::TimeScope;

    fn base_query() -> Query {
        Query {
            semantic: "Rust database".to_string(),
            time_scope: TimeScope::AllTime,
            context: QueryContext::AllChats,
            use_knowledge_graph: false,
            search_depth: SearchDepth::Shallow,
            temperature: Temperature::Hot,
            limit: 10,
            confidence_threshold: 0.0,
        }
    }

    #[test]
    fn test_fingerprint_ignores_word_order() {
        let a = fingerprint(&Query {
            semantic: "Rust database".to_string(),
            ..base_query()
        });
        let b = fingerprint(&Query {
            semantic: "database rust".to_string(),
            ..base_query()
        });
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_separates_contexts() {
        let all = fingerprint(&base_query());
        let chat = fingerprint(&Query {
            context: QueryContext::CurrentChat(common::NodeId::new("c1")),
            ..base_query()
        });
        assert_ne!(all, chat);
    }

    #[test]
    fn test_cost_grows_with_scope() {
        let narrow = estimate_cost_ms(1, 0, false, 10);
        let wide = estimate_cost_ms(5, 3, true, 10);
        assert!(wide > narrow * 2.0);
    }
}
