//! Data models for the storage layer.
//!
//! This module defines all core data structures using the Hybrid Schema Model:
//! - Strongly-typed fields for queryable, critical data
//! - Flexible `metadata` field for extensibility
//!
//! Indexes only ever cover the typed core; the metadata sidecar is opaque to
//! the rest of the system.

use crate::{EdgeId, EmbeddingId, NodeId};
use serde::{Deserialize, Serialize};

// --- Node Enum ---

/// The unifying enum for all types of nodes in the memory graph.
///
/// This allows storing different node types in the same `nodes` table while
/// maintaining type safety through Rust's enum system.
///
/// # Examples
///
/// ```
/// use common::models::{Node, Chat};
/// use common::NodeId;
/// use serde_json::json;
///
/// let chat = Chat {
///     id: NodeId::new("chat_123"),
///     title: "Project Discussion".to_string(),
///     created_at: 1697500000000,
///     updated_at: 1697500000000,
///     settings: json!({}),
///     message_ids: vec![],
///     metadata: json!({}),
/// };
///
/// let node = Node::Chat(chat);
/// assert_eq!(node.id().as_str(), "chat_123");
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Node {
    /// A conversation or chat session.
    Chat(Chat),
    /// A message within a chat.
    Message(Message),
    /// An extracted entity (person, place, concept, etc.).
    Entity(Entity),
    /// A hierarchical summary over a span of messages.
    Summary(Summary),
    /// A cached external tool result (search, scrape, API response).
    ToolResult(ToolResult),
    /// Agent action outcome for experience-based learning.
    ActionOutcome(ActionOutcome),
    /// User feedback referencing an action outcome.
    UserFeedback(UserFeedback),
    /// An aggregated success/error pattern.
    Pattern(Pattern),
}

impl Node {
    /// Returns the ID of the node regardless of its variant.
    #[inline]
    pub fn id(&self) -> &NodeId {
        match self {
            Node::Chat(c) => &c.id,
            Node::Message(m) => &m.id,
            Node::Entity(e) => &e.id,
            Node::Summary(s) => &s.id,
            Node::ToolResult(t) => &t.id,
            Node::ActionOutcome(a) => &a.id,
            Node::UserFeedback(f) => &f.id,
            Node::Pattern(p) => &p.id,
        }
    }

    /// Returns the stable type name of the node variant.
    ///
    /// Used as an indexed property (`node_type`) and for event routing.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Chat(_) => "Chat",
            Node::Message(_) => "Message",
            Node::Entity(_) => "Entity",
            Node::Summary(_) => "Summary",
            Node::ToolResult(_) => "ToolResult",
            Node::ActionOutcome(_) => "ActionOutcome",
            Node::UserFeedback(_) => "UserFeedback",
            Node::Pattern(_) => "Pattern",
        }
    }
}

// --- Concrete Node Types ---

/// A conversation or chat session.
///
/// Represents a top-level container for messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Chat {
    // --- Core, Indexed Fields ---
    /// Unique identifier for this chat.
    pub id: NodeId,
    /// User-facing title of the chat.
    pub title: String,
    /// Unix timestamp (milliseconds) when the chat was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the chat was last updated.
    pub updated_at: i64,

    // --- Core, Unindexed Fields ---
    /// Per-chat settings (model choice, system prompt, ...).
    #[serde(with = "crate::json_blob")]
    pub settings: serde_json::Value,
    /// IDs of messages belonging to this chat, in insertion order.
    pub message_ids: Vec<NodeId>,

    // --- Flexible, Unindexed "Sidecar" Data ---
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

/// The role a message sender plays in a conversation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Stable lowercase name, used as an indexed property value.
    pub fn name(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A message within a chat.
///
/// Messages are immutable once committed; edits are modeled as new messages.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Message {
    // --- Core, Indexed Fields ---
    /// Unique identifier for this message.
    pub id: NodeId,
    /// ID of the chat this message belongs to.
    pub chat_id: NodeId,
    /// Sender identifier (e.g., "user", user ID, model name).
    pub sender: String,
    /// The conversational role of the sender.
    pub role: Role,
    /// Unix timestamp (milliseconds) when the message was sent.
    pub timestamp: i64,

    // --- Core, Unindexed Fields ---
    /// The text content of the message.
    pub text_content: String,
    /// References to attachments (paths or external ids).
    pub attachment_refs: Vec<String>,

    // --- Flexible, Unindexed "Sidecar" Data ---
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

/// Resolution class of an embedding model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Fast model, 384 dimensions. Used for immediate indexing on insert.
    Fast384,
    /// Accurate model, 1536 dimensions. Generated asynchronously.
    Accurate1536,
}

impl Resolution {
    /// The vector dimension for this resolution.
    pub fn dim(&self) -> usize {
        match self {
            Resolution::Fast384 => 384,
            Resolution::Accurate1536 => 1536,
        }
    }

    /// Short stable tag, used in deterministic embedding ids and table keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Resolution::Fast384 => "fast",
            Resolution::Accurate1536 => "accurate",
        }
    }
}

/// A high-dimensional vector embedding.
///
/// Every embedding carries the id of the source it was generated from, so
/// the whole `embeddings` database can be regenerated from `conversations`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Embedding {
    /// Unique identifier for this embedding.
    pub id: EmbeddingId,
    /// ID of the node (message, entity, page) this vector was derived from.
    pub source_id: NodeId,
    /// Which model class produced this vector.
    pub resolution: Resolution,
    /// The vector as a list of f32 values, L2-normalized.
    pub vector: Vec<f32>,
    /// The model version used to generate this embedding.
    pub model_version: String,
}

impl Embedding {
    /// Deterministic embedding id for a source at a given resolution.
    ///
    /// Re-embedding the same source is an idempotent upsert, which keeps the
    /// at-most-one-embedding-per-resolution invariant without a lookup.
    pub fn id_for(resolution: Resolution, source_id: &NodeId) -> EmbeddingId {
        EmbeddingId::new(format!("emb:{}:{}", resolution.tag(), source_id))
    }
}

/// Lifecycle status of an extracted entity.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Newly extracted, low confidence.
    Inferred,
    /// Seen repeatedly; lives in the active knowledge tier.
    Active,
    /// Proven important (high mention count); lives in the stable tier.
    Stable,
}

impl EntityStatus {
    pub fn name(&self) -> &'static str {
        match self {
            EntityStatus::Inferred => "inferred",
            EntityStatus::Active => "active",
            EntityStatus::Stable => "stable",
        }
    }
}

/// An extracted entity (person, place, concept, etc.).
///
/// Entities are identified through Named Entity Recognition (NER)
/// and linked across conversations.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Entity {
    // --- Core, Indexed Fields ---
    /// Unique identifier for this entity.
    pub id: NodeId,
    /// The canonical name of the entity (e.g., "Project Phoenix").
    pub label: String,
    /// Type of entity (e.g., "PERSON", "GPE", "CONCEPT").
    pub entity_type: String,
    /// Promotion status across knowledge tiers.
    pub status: EntityStatus,

    // --- Core, Unindexed Fields ---
    /// Unix timestamp (milliseconds) of the first mention.
    pub first_seen_at: i64,
    /// Number of MENTIONS edges pointing at this entity.
    ///
    /// Eventually consistent; reconciled by the `Reconcile` batch task.
    pub mention_count: u64,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,

    // --- Flexible, Unindexed "Sidecar" Data ---
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

// --- Edge ---

/// A directed, typed relationship between two nodes.
///
/// Edges are references by id, never owning pointers; algorithms receive a
/// read-only view over them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Edge {
    /// Unique identifier for this edge.
    pub id: EdgeId,
    /// ID of the source node.
    pub from_node: NodeId,
    /// ID of the target node.
    pub to_node: NodeId,
    /// Type of relationship (e.g., "MENTIONS", "RELATED_TO").
    pub relation_type: String,
    /// Relationship strength in [0, 1] (or a PMI-like score for
    /// associative links).
    pub weight: f32,
    /// The message whose processing produced this edge, if any.
    pub source_message_id: Option<NodeId>,
    /// Unix timestamp (milliseconds) when the edge was created.
    pub created_at: i64,
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

/// Well-known relation types.
pub mod relation {
    /// A message mentions an entity.
    pub const MENTIONS: &str = "MENTIONS";
    /// Two entities co-occur often enough to be associated.
    pub const RELATED_TO: &str = "RELATED_TO";
}

/// The span a summary covers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummaryScope {
    Session,
    Daily,
    Weekly,
    Monthly,
}

impl SummaryScope {
    pub fn name(&self) -> &'static str {
        match self {
            SummaryScope::Session => "session",
            SummaryScope::Daily => "daily",
            SummaryScope::Weekly => "weekly",
            SummaryScope::Monthly => "monthly",
        }
    }
}

/// A summary over a span of messages.
///
/// Generated on schedule by the weaver's summarizer and regenerated as the
/// underlying span changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Summary {
    /// Unique identifier for this summary.
    pub id: NodeId,
    /// The hierarchy level this summary belongs to.
    pub scope: SummaryScope,
    /// Start of the covered span (Unix milliseconds, inclusive).
    pub start_ts: i64,
    /// End of the covered span (Unix milliseconds, exclusive).
    pub end_ts: i64,
    /// The summary text content.
    pub content: String,
    /// IDs of messages covered by this summary.
    pub covered_message_ids: Vec<NodeId>,
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

/// A cached external tool result (web search, scraped page, API response).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolResult {
    /// Unique identifier for this tool result.
    pub id: NodeId,
    /// Name of the tool that produced this result (e.g., "web_search").
    pub tool_name: String,
    /// The query or URL the tool was invoked with.
    pub query: String,
    /// Fast-resolution embedding of the query, for cache matching.
    pub query_embedding: Option<Vec<f32>>,
    /// The raw response payload.
    #[serde(with = "crate::json_blob")]
    pub response: serde_json::Value,
    /// Unix timestamp (milliseconds) when the result was fetched.
    pub fetched_at: i64,
    /// The message whose handling triggered this fetch, if any.
    pub triggered_by_msg_id: Option<NodeId>,
    /// Time-to-live in milliseconds; after this the entry is stale and
    /// re-fetchable.
    pub ttl_ms: i64,
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

impl ToolResult {
    /// Whether this cached result has outlived its TTL.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.fetched_at) > self.ttl_ms
    }
}

/// Types of user feedback on agent actions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackType {
    /// User corrected the agent's action.
    Correction,
    /// User approved the agent's action.
    Approval,
    /// User rejected the agent's action.
    Rejection,
}

impl FeedbackType {
    pub fn name(&self) -> &'static str {
        match self {
            FeedbackType::Correction => "correction",
            FeedbackType::Approval => "approval",
            FeedbackType::Rejection => "rejection",
        }
    }
}

/// Agent action outcome for learning and improvement.
///
/// Records are append-only: inserting an outcome with an existing id is a
/// `Conflict`. Feedback is a separate [`UserFeedback`] record referencing the
/// outcome id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionOutcome {
    /// Unique identifier for this action outcome.
    pub id: NodeId,
    /// Type of action performed (e.g., "query", "search", "summarize").
    pub action_type: String,
    /// Arguments passed to the action.
    #[serde(with = "crate::json_blob")]
    pub action_args: serde_json::Value,
    /// Result of the action (success/failure and returned data).
    #[serde(with = "crate::json_blob")]
    pub result: serde_json::Value,
    /// Unix timestamp (milliseconds) when the action was performed.
    pub timestamp: i64,
    /// The message in whose context the action occurred, if any.
    pub context_msg_id: Option<NodeId>,
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

/// User feedback on an agent action.
///
/// Stored separately from the outcome so outcomes stay append-only.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserFeedback {
    /// Unique identifier for this feedback record.
    pub id: NodeId,
    /// The action outcome this feedback refers to.
    pub outcome_id: NodeId,
    /// The kind of feedback provided.
    pub feedback: FeedbackType,
    /// Optional user comment explaining the feedback.
    pub comment: Option<String>,
    /// Unix timestamp (milliseconds) when the feedback was provided.
    pub timestamp: i64,
}

/// Kind of aggregated behavior pattern.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Success,
    Error,
}

impl PatternKind {
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::Success => "success",
            PatternKind::Error => "error",
        }
    }
}

/// An aggregated success or error pattern, distilled from action outcomes.
///
/// Pattern confidence blends a Wilson-interval lower bound over the
/// success/failure counts with recency decay; it fades as `last_used` ages.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pattern {
    /// Unique identifier for this pattern.
    pub id: NodeId,
    /// Whether this is a success or error pattern.
    pub kind: PatternKind,
    /// The pattern description (action shape, argument template, ...).
    #[serde(with = "crate::json_blob")]
    pub pattern: serde_json::Value,
    /// Number of outcomes matching this pattern that succeeded.
    pub success_count: u64,
    /// Number of outcomes matching this pattern that failed.
    pub failure_count: u64,
    /// Calibrated confidence in [0, 1].
    pub confidence: f32,
    /// Unix timestamp (milliseconds) this pattern last influenced a decision.
    pub last_used: i64,
    /// Application-specific metadata stored as JSON.
    #[serde(with = "crate::json_blob")]
    pub metadata: serde_json::Value,
}

impl Pattern {
    /// Lower bound of the Wilson score interval at z = 1.96, decayed by age.
    ///
    /// `half_life_ms` controls the recency decay; confidence halves every
    /// half-life since `last_used`.
    pub fn calibrated_confidence(&self, now_ms: i64, half_life_ms: i64) -> f32 {
        let n = (self.success_count + self.failure_count) as f64;
        if n == 0.0 {
            return 0.0;
        }
        let p = self.success_count as f64 / n;
        let z = 1.96f64;
        let z2 = z * z;
        let denom = 1.0 + z2 / n;
        let center = p + z2 / (2.0 * n);
        let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt();
        let wilson = ((center - margin) / denom).max(0.0);

        let age = now_ms.saturating_sub(self.last_used).max(0) as f64;
        let decay = 0.5f64.powf(age / half_life_ms.max(1) as f64);
        (wilson * decay) as f32
    }
}
