//! Query descriptors and result envelopes for the converged pipeline.

use common::models::Message;
use common::NodeId;
use serde::{Deserialize, Serialize};
use storage::TimeScope;

/// Which conversations a query ranges over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryContext {
    /// Only the given chat.
    CurrentChat(NodeId),
    /// Every chat.
    AllChats,
    /// The given chat plus chats sharing entities with it (1-hop).
    RelatedChats(NodeId),
    /// Messages mentioning any of the given entities.
    ByTopic(Vec<NodeId>),
}

/// How far graph expansion may walk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SearchDepth {
    /// No expansion beyond direct mentions.
    Shallow,
    /// Exactly `k` hops.
    Level(usize),
    /// Deep expansion (bounded by the frontier cap).
    Deep,
}

impl SearchDepth {
    /// Hop budget for this depth.
    pub fn hops(&self) -> usize {
        match self {
            SearchDepth::Shallow => 0,
            SearchDepth::Level(k) => *k,
            SearchDepth::Deep => 3,
        }
    }
}

/// Which temperature tiers a query touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Temperature {
    /// Active tier only.
    Hot,
    /// Active and recent.
    Warm,
    /// Archive tiers only.
    Cold,
    /// Everything.
    All,
}

/// The unified query descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Natural-language search text.
    pub semantic: String,
    /// Time window of interest.
    pub time_scope: TimeScope,
    /// Conversation scope.
    pub context: QueryContext,
    /// Whether stage 3 graph expansion runs.
    pub use_knowledge_graph: bool,
    /// Expansion depth.
    pub search_depth: SearchDepth,
    /// Tier selection.
    pub temperature: Temperature,
    /// Maximum results.
    pub limit: usize,
    /// Minimum confidence for a result to survive ranking.
    pub confidence_threshold: f32,
}

impl Query {
    /// A query with sensible defaults: all time, all chats, hot tier,
    /// shallow, limit 10, threshold 0.
    pub fn semantic(text: impl Into<String>) -> Self {
        Self {
            semantic: text.into(),
            time_scope: TimeScope::AllTime,
            context: QueryContext::AllChats,
            use_knowledge_graph: false,
            search_depth: SearchDepth::Shallow,
            temperature: Temperature::Hot,
            limit: 10,
            confidence_threshold: 0.0,
        }
    }
}

/// The routing decision for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Tier labels to open ("active", "recent", archive buckets).
    pub tiers_to_open: Vec<String>,
    /// Logical databases touched.
    pub databases_to_scan: Vec<String>,
    /// Graph expansion hop budget.
    pub max_depth: usize,
    /// Whether stage 3 runs at all.
    pub use_knowledge_graph: bool,
    /// Heuristic cost estimate in milliseconds.
    pub estimated_cost_ms: f64,
    /// Whether the plan was narrowed to fit the budget.
    pub downshifted: bool,
    /// Whether meta-memory (cache or prior feedback) shaped this plan.
    pub informed_by_meta: bool,
}

/// One ranked query hit.
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// The matching message.
    pub message: Message,
    /// Combined confidence in [0, 1].
    pub confidence: f32,
    /// Stage-2 semantic score.
    pub semantic_score: f32,
    /// Stage-3 graph proximity score.
    pub graph_score: f32,
    /// Recency score.
    pub recency_score: f32,
    /// Historical-success score from the experience database.
    pub experience_score: f32,
    /// Entities attached during graph expansion.
    pub related_entities: Vec<NodeId>,
    /// Which stages contributed, e.g.
    /// "stage1:structural, stage2:semantic/fast+rerank".
    pub reasoning: String,
}

/// The result envelope.
#[derive(Debug)]
pub struct QueryResponse {
    /// Ranked hits, best first.
    pub results: Vec<QueryHit>,
    /// True when the pipeline stopped early (deadline, degraded index).
    pub incomplete: bool,
    /// Why the response is incomplete, when it is.
    pub reason: Option<String>,
    /// True when the query's cancellation token fired.
    pub cancelled: bool,
    /// Id of the performance-stats row (doubles as the action-outcome id
    /// user feedback should reference).
    pub stats_id: NodeId,
    /// The plan that was executed.
    pub plan: QueryPlan,
}
