//! Converged query engine.
//!
//! Executes [`Query`] descriptors through the 4-stage pipeline:
//!
//! 1. **Meta routing** - consult the routing cache and prior feedback,
//!    estimate cost, narrow the plan to the budget.
//! 2. **Structural filter** - derive the candidate message set from time
//!    scope and conversation context via the structural indexes.
//! 3. **Two-stage semantic search** - fast HNSW retrieval oversampling
//!    3x the limit, then precise reranking of the survivors.
//! 4. **Graph expansion** - walk the knowledge graph outward from each
//!    hit, attaching related entities (bounded frontier).
//! 5. **Rank** - fuse semantic, graph, recency, and experience signals
//!    into a confidence score, filter, and cut to the limit.
//!
//! Queries run under a deadline: an overrun returns the results of the last
//! completed stage with `incomplete=true`. Every execution leaves a
//! performance-stats row and an action outcome that later feedback can
//! reference, closing the meta-memory loop.

pub mod models;
pub mod planner;
pub mod stats;

pub use models::{Query, QueryContext, QueryHit, QueryPlan, QueryResponse, SearchDepth, Temperature};
pub use stats::PerformanceStats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::models::{ActionOutcome, PatternKind, Resolution};
use common::{DbResult, EdgeId, NodeId};
use embedding::EmbeddingPipeline;
use hashbrown::HashSet;
use indexing::algorithms::{bfs_expand, GraphView};
use storage::{Coordinator, DatabaseKind, StorageManager, TemperatureTier, TierAddress};
use task_scheduler::TaskScheduler;
use tokio_util::sync::CancellationToken;

/// Frontier cap for stage-3 expansion.
const EXPANSION_CAP: usize = 64;

/// Half-life for experience-pattern decay (30 days).
const PATTERN_HALF_LIFE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Read-only graph view over a knowledge store's adjacency tables.
struct KnowledgeView<'a> {
    store: &'a StorageManager,
}

impl GraphView for KnowledgeView<'_> {
    fn node_ids(&self) -> DbResult<Vec<NodeId>> {
        Ok(self
            .store
            .iter_edges()?
            .into_iter()
            .flat_map(|e| [e.from_node, e.to_node])
            .collect())
    }

    fn neighbors(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>> {
        let mut out = Vec::new();
        for (edge_id, target) in self.store.outgoing(node.as_str())? {
            let weight = self
                .store
                .get_edge(edge_id.as_str())?
                .map(|e| e.weight)
                .unwrap_or(1.0);
            out.push((edge_id, target, weight));
        }
        Ok(out)
    }

    fn neighbors_incoming(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>> {
        let mut out = Vec::new();
        for (edge_id, source) in self.store.incoming(node.as_str())? {
            let weight = self
                .store
                .get_edge(edge_id.as_str())?
                .map(|e| e.weight)
                .unwrap_or(1.0);
            out.push((edge_id, source, weight));
        }
        Ok(out)
    }
}

/// The unified query engine.
pub struct QueryEngine {
    coordinator: Arc<Coordinator>,
    pipeline: Arc<EmbeddingPipeline>,
    scheduler: Arc<TaskScheduler>,
}

impl QueryEngine {
    pub fn new(
        coordinator: Arc<Coordinator>,
        pipeline: Arc<EmbeddingPipeline>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            coordinator,
            pipeline,
            scheduler,
        }
    }

    /// Executes a query with a fresh cancellation token.
    pub async fn execute(&self, query: &Query) -> DbResult<QueryResponse> {
        self.execute_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Executes a query under cooperative cancellation.
    ///
    /// Cancellation and deadline are checked at stage boundaries; both paths
    /// return whatever the last completed stage produced, flagged
    /// accordingly. The performance-stats row is written in every case.
    pub async fn execute_with_cancel(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> DbResult<QueryResponse> {
        // The request path drives the activity model.
        self.scheduler.record_activity();

        let started = Instant::now();
        let started_at = common::now_ms();
        let deadline = Duration::from_millis(self.coordinator.config().query_deadline_ms);
        let stats_id = stats::new_stats_id();
        let fingerprint = planner::fingerprint(query);
        let mut stages: Vec<String> = Vec::new();

        // --- Stage 0: meta routing ---
        let plan = planner::plan(&self.coordinator, self.coordinator.config(), query)?;
        stages.push("stage0:plan".to_string());

        let mut incomplete = false;
        let mut reason: Option<String> = None;
        if self.coordinator.is_degraded(DatabaseKind::Embeddings)
            || (plan.use_knowledge_graph && self.coordinator.is_degraded(DatabaseKind::Knowledge))
        {
            incomplete = true;
            reason = Some("degraded-index".to_string());
            log::warn!("query running against degraded indexes");
        }

        let conversation_stores = self.stores_for_plan(DatabaseKind::Conversations, &plan)?;
        let embedding_stores = self.stores_for_plan(DatabaseKind::Embeddings, &plan)?;

        // --- Stage 1: structural filter ---
        let candidates = self.structural_candidates(query, &conversation_stores)?;
        stages.push("stage1:structural".to_string());

        let mut results: Vec<QueryHit> = Vec::new();

        'pipeline: {
            if candidates.is_empty() {
                break 'pipeline;
            }
            if cancel.is_cancelled() {
                reason = Some("cancelled".to_string());
                break 'pipeline;
            }
            if started.elapsed() > deadline {
                incomplete = true;
                reason = Some("deadline".to_string());
                break 'pipeline;
            }

            // --- Stage 2: two-stage semantic search ---
            let scored = self
                .semantic_stage(query, &candidates, &embedding_stores, &mut stages)
                .await?;

            if cancel.is_cancelled() {
                reason = Some("cancelled".to_string());
                break 'pipeline;
            }
            if started.elapsed() > deadline {
                incomplete = true;
                reason = Some("deadline".to_string());
                // Partial: semantic scores without expansion or full rank.
                results = self.assemble(query, &plan, scored, false)?;
                break 'pipeline;
            }

            // --- Stage 3: graph expansion ---
            let expand = plan.use_knowledge_graph && plan.max_depth > 0;
            if expand {
                stages.push(format!("stage3:graph({} hops)", plan.max_depth));
            }

            // --- Stage 4: rank & reason ---
            results = self.assemble(query, &plan, scored, expand)?;
            stages.push("stage4:rank".to_string());
        }

        // A cancelled query still persists its stats row, marked cancelled.
        let cancelled = cancel.is_cancelled();
        let wall_ms = started.elapsed().as_millis() as u64;

        let stats_row = PerformanceStats {
            id: stats_id.as_str().to_string(),
            fingerprint: fingerprint.clone(),
            started_at,
            wall_ms,
            stages,
            result_count: results.len(),
            cancelled,
            incomplete,
            downshifted: plan.downshifted,
        };
        stats::record(&self.coordinator.meta(), &stats_row)?;
        planner::record_outcome(
            &self.coordinator,
            &fingerprint,
            &plan,
            wall_ms,
            stats_id.as_str(),
        )?;

        // The outcome row is what later user feedback references.
        let outcome = ActionOutcome {
            id: stats_id.clone(),
            action_type: "query".to_string(),
            action_args: serde_json::json!({
                "fingerprint": fingerprint,
                "semantic": query.semantic,
            }),
            result: serde_json::json!({
                "result_count": results.len(),
                "incomplete": incomplete,
            }),
            timestamp: started_at,
            context_msg_id: None,
            metadata: serde_json::json!({}),
        };
        if let Err(err) = self.coordinator.insert_action_outcome(outcome) {
            log::debug!("query outcome not recorded: {err}");
        }

        Ok(QueryResponse {
            results,
            incomplete,
            reason,
            cancelled,
            stats_id,
            plan,
        })
    }

    /// Resolves the tier stores a plan touches, opening lazy tiers on
    /// demand.
    fn stores_for_plan(
        &self,
        kind: DatabaseKind,
        plan: &QueryPlan,
    ) -> DbResult<Vec<Arc<StorageManager>>> {
        let mut stores = Vec::new();
        for label in &plan.tiers_to_open {
            let address = match label.as_str() {
                "active" => TierAddress::new(kind, Some(TemperatureTier::Active)),
                "recent" => TierAddress::new(kind, Some(TemperatureTier::Recent)),
                bucket => TierAddress::archive(kind, bucket),
            };
            match self.coordinator.open_tier(&address) {
                Ok(store) => stores.push(store),
                Err(err) => log::debug!("tier {label} unavailable: {err}"),
            }
        }
        Ok(stores)
    }

    /// Stage 1: candidate message ids from time scope and context.
    fn structural_candidates(
        &self,
        query: &Query,
        stores: &[Arc<StorageManager>],
    ) -> DbResult<HashSet<String>> {
        let now = common::now_ms();
        let (start, end) = query.time_scope.to_range(now);
        let mut candidates: HashSet<String> = HashSet::new();

        match &query.context {
            QueryContext::CurrentChat(chat_id) => {
                for store in stores {
                    for message in store.messages_by_chat(chat_id.as_str(), Some((start, end)))? {
                        candidates.insert(message.id.into_inner());
                    }
                }
            }
            QueryContext::AllChats => {
                for store in stores {
                    let in_range: HashSet<String> = store
                        .index()
                        .nodes_by_time_range(store.env(), start, end)?
                        .into_iter()
                        .map(NodeId::into_inner)
                        .collect();
                    for id in store.nodes_by_property("node_type", "Message")? {
                        if in_range.contains(id.as_str()) {
                            candidates.insert(id.into_inner());
                        }
                    }
                }
            }
            QueryContext::RelatedChats(chat_id) => {
                let chats = self.related_chats(chat_id)?;
                for store in stores {
                    for chat in &chats {
                        for message in store.messages_by_chat(chat.as_str(), Some((start, end)))? {
                            candidates.insert(message.id.into_inner());
                        }
                    }
                }
            }
            QueryContext::ByTopic(entity_ids) => {
                let knowledge = self.coordinator.knowledge_active();
                for entity_id in entity_ids {
                    for (edge_id, source) in knowledge.incoming(entity_id.as_str())? {
                        let Some(edge) = knowledge.get_edge(edge_id.as_str())? else {
                            continue;
                        };
                        if edge.relation_type != common::models::relation::MENTIONS {
                            continue;
                        }
                        if let Some(message) = self.coordinator.get_message(source.as_str())? {
                            if message.timestamp >= start && message.timestamp <= end {
                                candidates.insert(message.id.into_inner());
                            }
                        }
                    }
                }
            }
        }

        Ok(candidates)
    }

    /// The given chat plus every chat whose messages mention an entity this
    /// chat's messages mention (1-hop through the knowledge graph).
    fn related_chats(&self, chat_id: &NodeId) -> DbResult<Vec<NodeId>> {
        let knowledge = self.coordinator.knowledge_active();
        let mut chats: Vec<NodeId> = vec![chat_id.clone()];
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(chat_id.as_str().to_string());

        let own_messages = self.coordinator.iter_messages_by_chat(chat_id.as_str(), None)?;
        let mut entities: HashSet<String> = HashSet::new();
        for message in &own_messages {
            for (edge_id, target) in knowledge.outgoing(message.id.as_str())? {
                if let Some(edge) = knowledge.get_edge(edge_id.as_str())? {
                    if edge.relation_type == common::models::relation::MENTIONS {
                        entities.insert(target.into_inner());
                    }
                }
            }
        }

        for entity in &entities {
            for (edge_id, source) in knowledge.incoming(entity)? {
                let Some(edge) = knowledge.get_edge(edge_id.as_str())? else {
                    continue;
                };
                if edge.relation_type != common::models::relation::MENTIONS {
                    continue;
                }
                if let Some(message) = self.coordinator.get_message(source.as_str())? {
                    if seen.insert(message.chat_id.as_str().to_string()) {
                        chats.push(message.chat_id);
                    }
                }
            }
        }

        Ok(chats)
    }

    /// Stage 2: fast HNSW retrieval then precise reranking.
    ///
    /// Returns `(message_id, semantic_score)` pairs, best first, at most
    /// `3 * limit` entries.
    async fn semantic_stage(
        &self,
        query: &Query,
        candidates: &HashSet<String>,
        embedding_stores: &[Arc<StorageManager>],
        stages: &mut Vec<String>,
    ) -> DbResult<Vec<(String, f32)>> {
        let config = self.coordinator.config();
        let oversample = query.limit.saturating_mul(3).max(1);
        let query_fast = self
            .pipeline
            .embed_query(Resolution::Fast384, &query.semantic)
            .await?;

        // 2a: approximate retrieval, restricted to the candidate set.
        let mut fast_scores: HashMap<String, f32> = HashMap::new();
        for store in embedding_stores {
            let hits = store.search_vectors(
                Resolution::Fast384,
                &query_fast,
                oversample + candidates.len().min(oversample),
                config.hnsw_ef_search,
            )?;
            for hit in hits {
                let Some(source) = hit.id.as_str().strip_prefix("emb:fast:") else {
                    continue;
                };
                if !candidates.contains(source) {
                    continue;
                }
                let entry = fast_scores.entry(source.to_string()).or_insert(f32::MIN);
                *entry = entry.max(hit.similarity());
            }
        }
        stages.push("stage2:semantic/fast".to_string());

        // Degraded path: nothing retrievable from the vector index, fall
        // through to scoring the structural candidates directly.
        let mut shortlist: Vec<(String, f32)> = if fast_scores.is_empty() {
            candidates
                .iter()
                .take(oversample)
                .map(|id| (id.clone(), 0.0))
                .collect()
        } else {
            let mut scored: Vec<(String, f32)> = fast_scores.into_iter().collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(oversample);
            scored
        };

        // 2b: precise rerank over the shortlist.
        let mut texts: Vec<(String, String)> = Vec::with_capacity(shortlist.len());
        for (id, _) in &shortlist {
            if let Some(message) = self.coordinator.get_message(id)? {
                texts.push((id.clone(), message.text_content));
            }
        }
        if !texts.is_empty() {
            let reranked = self.pipeline.rerank(&query.semantic, &texts).await?;
            let precise: HashMap<String, f32> = reranked.into_iter().collect();
            let (lo, hi) = precise.values().fold((f32::MAX, f32::MIN), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
            let span = (hi - lo).max(f32::EPSILON);
            for (id, score) in shortlist.iter_mut() {
                if let Some(raw) = precise.get(id) {
                    let normalized = if precise.len() > 1 {
                        (raw - lo) / span
                    } else {
                        raw.clamp(0.0, 1.0)
                    };
                    *score = 0.5 * score.max(0.0) + 0.5 * normalized;
                }
            }
            stages.push("stage2:rerank".to_string());
        }

        shortlist.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(shortlist)
    }

    /// Stage 3 expansion for one message: related entities within the hop
    /// budget.
    fn expand_message(&self, message_id: &str, max_depth: usize) -> DbResult<Vec<NodeId>> {
        let knowledge = self.coordinator.knowledge_active();
        let view = KnowledgeView {
            store: knowledge.as_ref(),
        };

        let mut related: Vec<NodeId> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (edge_id, entity) in knowledge.outgoing(message_id)? {
            let Some(edge) = knowledge.get_edge(edge_id.as_str())? else {
                continue;
            };
            if edge.relation_type != common::models::relation::MENTIONS {
                continue;
            }
            if seen.insert(entity.as_str().to_string()) {
                related.push(entity.clone());
            }
            // Walk outward from each mentioned entity.
            for (node, _) in bfs_expand(&view, &entity, max_depth, EXPANSION_CAP)? {
                if seen.insert(node.as_str().to_string()) {
                    related.push(node);
                }
            }
            if related.len() >= EXPANSION_CAP {
                break;
            }
        }
        related.truncate(EXPANSION_CAP);
        Ok(related)
    }

    /// Experience signal for this query shape: prior approvals push it up,
    /// rejections push it down, success patterns add their calibrated
    /// confidence.
    fn experience_score(&self, fingerprint: &str, now_ms: i64) -> DbResult<f32> {
        let mut signal = 0.0f32;
        for outcome in self.coordinator.recent_outcomes("query", 16)? {
            if outcome
                .action_args
                .get("fingerprint")
                .and_then(|v| v.as_str())
                != Some(fingerprint)
            {
                continue;
            }
            for feedback in self
                .coordinator
                .feedback_for_outcome(outcome.id.as_str())?
            {
                signal += match feedback.feedback {
                    common::models::FeedbackType::Approval => 1.0,
                    common::models::FeedbackType::Rejection => -1.0,
                    common::models::FeedbackType::Correction => -0.5,
                };
            }
        }

        let mut pattern_boost = 0.0f32;
        let patterns = self.coordinator.patterns_by_kind(PatternKind::Success)?;
        if !patterns.is_empty() {
            let total: f32 = patterns
                .iter()
                .map(|p| p.calibrated_confidence(now_ms, PATTERN_HALF_LIFE_MS))
                .sum();
            pattern_boost = total / patterns.len() as f32;
        }

        // Squash into [0, 1] around a neutral 0.5.
        Ok((0.5 + 0.2 * signal.tanh() + 0.3 * pattern_boost).clamp(0.0, 1.0))
    }

    /// Stage 4: fetch, expand, score, filter, truncate.
    fn assemble(
        &self,
        query: &Query,
        plan: &QueryPlan,
        scored: Vec<(String, f32)>,
        expand: bool,
    ) -> DbResult<Vec<QueryHit>> {
        let now = common::now_ms();
        let fingerprint = planner::fingerprint(query);
        let experience = self.experience_score(&fingerprint, now)?;

        let mut hits: Vec<QueryHit> = Vec::new();
        for (message_id, semantic_score) in scored {
            let Some(message) = self.coordinator.get_message(&message_id)? else {
                continue;
            };

            let related_entities = if expand {
                self.expand_message(&message_id, plan.max_depth)?
            } else {
                Vec::new()
            };
            let graph_score = if expand {
                1.0 - (-(related_entities.len() as f32) / 4.0).exp()
            } else {
                0.0
            };

            let age_days = (now.saturating_sub(message.timestamp)) as f32 / 86_400_000.0;
            let recency_score = (-age_days / 30.0).exp();

            let confidence = (0.55 * semantic_score.clamp(0.0, 1.0)
                + 0.15 * graph_score
                + 0.20 * recency_score
                + 0.10 * experience)
                .clamp(0.0, 1.0);

            if confidence < query.confidence_threshold {
                continue;
            }

            let mut reasoning = String::from("stage1:structural, stage2:semantic/fast+rerank");
            if expand && !related_entities.is_empty() {
                reasoning.push_str(&format!(
                    ", stage3:graph({} entities)",
                    related_entities.len()
                ));
            }
            reasoning.push_str(", stage4:rank");

            hits.push(QueryHit {
                message,
                confidence,
                semantic_score,
                graph_score,
                recency_score,
                experience_score: experience,
                related_entities,
                reasoning,
            });
        }

        hits.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.message.id.cmp(&b.message.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }
}
