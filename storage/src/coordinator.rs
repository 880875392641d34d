//! Database coordinator for the multi-tier memory architecture.
//!
//! The coordinator exclusively owns every environment: it opens the pinned
//! (hot) tiers at startup, lazily opens warm/cold tiers behind an LRU-capped
//! open set, and routes typed CRUD to the right tier. Other components
//! receive borrowed [`StorageManager`] handles and never open or close
//! environments.
//!
//! Cross-database writes are deliberately not atomic: commits land in the
//! SOURCE database first and derived artifacts are produced asynchronously,
//! which bounds crash recovery to re-running enrichment over whatever is
//! missing (see [`Coordinator::scan_missing_fast_embeddings`]).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use common::config::CoreConfig;
use common::models::{
    ActionOutcome, Chat, Edge, Embedding, Entity, EntityStatus, Message, Node, Pattern,
    PatternKind, Resolution, Summary, SummaryScope, ToolResult, UserFeedback,
};
use common::{DbError, DbResult, NodeId};
use indexing::HnswConfig;
use tokio::sync::mpsc;

use crate::database_type::{bucket_for_timestamp, DatabaseKind, TemperatureTier, TierAddress};
use crate::events::{EventBus, MutationEvent};
use crate::store::StorageManager;

struct LazyTier {
    store: Arc<StorageManager>,
    last_access: Instant,
}

/// High-level coordinator for all logical databases in the memory system.
pub struct Coordinator {
    root: PathBuf,
    config: CoreConfig,
    events: EventBus,
    event_receiver: Mutex<Option<mpsc::Receiver<MutationEvent>>>,

    // Pinned environments, open for the process lifetime.
    conversations_active: Arc<StorageManager>,
    knowledge_active: Arc<StorageManager>,
    knowledge_stable: Arc<StorageManager>,
    knowledge_inferred: Arc<StorageManager>,
    embeddings_active: Arc<StorageManager>,
    tool_results: Arc<StorageManager>,
    experience: Arc<StorageManager>,
    meta: Arc<StorageManager>,
    model_cache: Arc<StorageManager>,
    logs: Arc<StorageManager>,

    // Lazily opened tiers (recent, archive buckets, summary scopes),
    // LRU-evicted past the configured cap.
    lazy: Mutex<HashMap<TierAddress, LazyTier>>,

    degraded: RwLock<HashSet<DatabaseKind>>,
    log_seq: AtomicU64,
    // Serializes find-or-create entity upserts across weaver workers.
    entity_lock: Mutex<()>,
}

impl Coordinator {
    /// Opens every pinned environment under `root`, creating what is
    /// missing, and runs the startup health scan.
    pub fn open(root: &Path, config: CoreConfig) -> DbResult<Self> {
        let (events, receiver) = EventBus::new(config.event_channel_capacity);
        let hnsw = HnswConfig {
            max_connections: config.hnsw_m,
            ef_construction: config.hnsw_ef_construction,
            ef_search: config.hnsw_ef_search,
            ..HnswConfig::default()
        };

        let open_pinned = |kind: DatabaseKind, tier: Option<TemperatureTier>| {
            let address = TierAddress::new(kind, tier);
            StorageManager::open(&address.path(root), kind, tier, hnsw, Some(events.clone()))
                .map(Arc::new)
        };

        let coordinator = Self {
            root: root.to_path_buf(),
            conversations_active: open_pinned(
                DatabaseKind::Conversations,
                Some(TemperatureTier::Active),
            )?,
            knowledge_active: open_pinned(DatabaseKind::Knowledge, Some(TemperatureTier::Active))?,
            knowledge_stable: open_pinned(DatabaseKind::Knowledge, Some(TemperatureTier::Stable))?,
            knowledge_inferred: open_pinned(
                DatabaseKind::Knowledge,
                Some(TemperatureTier::Inferred),
            )?,
            embeddings_active: open_pinned(
                DatabaseKind::Embeddings,
                Some(TemperatureTier::Active),
            )?,
            tool_results: open_pinned(DatabaseKind::ToolResults, None)?,
            experience: open_pinned(DatabaseKind::Experience, None)?,
            meta: open_pinned(DatabaseKind::Meta, None)?,
            model_cache: open_pinned(DatabaseKind::ModelCache, None)?,
            logs: open_pinned(DatabaseKind::Logs, None)?,
            lazy: Mutex::new(HashMap::new()),
            degraded: RwLock::new(HashSet::new()),
            log_seq: AtomicU64::new(0),
            entity_lock: Mutex::new(()),
            event_receiver: Mutex::new(Some(receiver)),
            events,
            config,
        };

        coordinator.startup_health_scan()?;
        Ok(coordinator)
    }

    /// Opens the coordinator at the configured data root (explicit field,
    /// `MIA_DATA_DIR`, or the per-OS application-data directory).
    pub fn open_default(config: CoreConfig) -> DbResult<Self> {
        let root = config.resolve_data_root();
        std::fs::create_dir_all(&root)?;
        Self::open(&root, config)
    }

    /// Flushes every open environment and drops lazy tiers.
    pub fn close(&self) -> DbResult<()> {
        for store in self.pinned_stores() {
            store.sync()?;
        }
        let mut lazy = self.lazy.lock().map_err(poisoned)?;
        for tier in lazy.values() {
            tier.store.sync()?;
        }
        lazy.clear();
        Ok(())
    }

    /// The configuration this coordinator runs with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Takes the single mutation-event receiver. The weaver wiring calls
    /// this once.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<MutationEvent>> {
        self.event_receiver.lock().ok().and_then(|mut r| r.take())
    }

    /// Dropped-event count since the last call; non-zero means a backfill
    /// scan is due.
    pub fn take_dropped_events(&self) -> u64 {
        self.events.take_dropped()
    }

    fn pinned_stores(&self) -> Vec<Arc<StorageManager>> {
        vec![
            Arc::clone(&self.conversations_active),
            Arc::clone(&self.knowledge_active),
            Arc::clone(&self.knowledge_stable),
            Arc::clone(&self.knowledge_inferred),
            Arc::clone(&self.embeddings_active),
            Arc::clone(&self.tool_results),
            Arc::clone(&self.experience),
            Arc::clone(&self.meta),
            Arc::clone(&self.model_cache),
            Arc::clone(&self.logs),
        ]
    }

    // --- Direct store access (borrowed handles for services) ---

    pub fn conversations_active(&self) -> Arc<StorageManager> {
        Arc::clone(&self.conversations_active)
    }

    pub fn knowledge_active(&self) -> Arc<StorageManager> {
        Arc::clone(&self.knowledge_active)
    }

    pub fn knowledge_stable(&self) -> Arc<StorageManager> {
        Arc::clone(&self.knowledge_stable)
    }

    pub fn knowledge_inferred(&self) -> Arc<StorageManager> {
        Arc::clone(&self.knowledge_inferred)
    }

    pub fn embeddings_active(&self) -> Arc<StorageManager> {
        Arc::clone(&self.embeddings_active)
    }

    pub fn tool_results(&self) -> Arc<StorageManager> {
        Arc::clone(&self.tool_results)
    }

    pub fn experience(&self) -> Arc<StorageManager> {
        Arc::clone(&self.experience)
    }

    pub fn meta(&self) -> Arc<StorageManager> {
        Arc::clone(&self.meta)
    }

    pub fn model_cache(&self) -> Arc<StorageManager> {
        Arc::clone(&self.model_cache)
    }

    // --- Lazy tier management ---

    /// Opens (or returns the already-open) environment for `address`.
    ///
    /// Pinned tiers resolve to their permanent handle. Lazy tiers join an
    /// open set bounded by `open_tier_cap`; the least recently used
    /// non-pinned tier is evicted past the cap.
    pub fn open_tier(&self, address: &TierAddress) -> DbResult<Arc<StorageManager>> {
        if let Some(store) = self.pinned_for(address) {
            return Ok(store);
        }

        let hnsw = HnswConfig {
            max_connections: self.config.hnsw_m,
            ef_construction: self.config.hnsw_ef_construction,
            ef_search: self.config.hnsw_ef_search,
            ..HnswConfig::default()
        };

        let mut lazy = self.lazy.lock().map_err(poisoned)?;
        if let Some(tier) = lazy.get_mut(address) {
            tier.last_access = Instant::now();
            return Ok(Arc::clone(&tier.store));
        }

        let store = Arc::new(StorageManager::open(
            &address.path(&self.root),
            address.kind,
            address.tier,
            hnsw,
            Some(self.events.clone()),
        )?);
        lazy.insert(
            address.clone(),
            LazyTier {
                store: Arc::clone(&store),
                last_access: Instant::now(),
            },
        );

        while lazy.len() > self.config.open_tier_cap {
            let oldest = lazy
                .iter()
                .filter(|(key, _)| *key != address)
                .min_by_key(|(_, tier)| tier.last_access)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    if let Some(evicted) = lazy.remove(&key) {
                        let _ = evicted.store.sync();
                        log::debug!("evicted tier {key:?} from open set");
                    }
                }
                None => break,
            }
        }

        Ok(store)
    }

    fn pinned_for(&self, address: &TierAddress) -> Option<Arc<StorageManager>> {
        match (address.kind, address.tier) {
            (DatabaseKind::Conversations, Some(TemperatureTier::Active)) => {
                Some(self.conversations_active())
            }
            (DatabaseKind::Knowledge, Some(TemperatureTier::Active)) => {
                Some(self.knowledge_active())
            }
            (DatabaseKind::Knowledge, Some(TemperatureTier::Stable)) => {
                Some(self.knowledge_stable())
            }
            (DatabaseKind::Knowledge, Some(TemperatureTier::Inferred)) => {
                Some(self.knowledge_inferred())
            }
            (DatabaseKind::Embeddings, Some(TemperatureTier::Active)) => {
                Some(self.embeddings_active())
            }
            (DatabaseKind::ToolResults, _) => Some(self.tool_results()),
            (DatabaseKind::Experience, _) => Some(self.experience()),
            (DatabaseKind::Meta, _) => Some(self.meta()),
            (DatabaseKind::ModelCache, _) => Some(self.model_cache()),
            (DatabaseKind::Logs, _) => Some(Arc::clone(&self.logs)),
            _ => None,
        }
    }

    /// Currently open tiers of a database, active first. Does not open
    /// anything new.
    pub fn open_stores_of(&self, kind: DatabaseKind) -> Vec<Arc<StorageManager>> {
        let mut stores: Vec<Arc<StorageManager>> = match kind {
            DatabaseKind::Conversations => vec![self.conversations_active()],
            DatabaseKind::Knowledge => vec![
                self.knowledge_active(),
                self.knowledge_stable(),
                self.knowledge_inferred(),
            ],
            DatabaseKind::Embeddings => vec![self.embeddings_active()],
            DatabaseKind::ToolResults => vec![self.tool_results()],
            DatabaseKind::Experience => vec![self.experience()],
            DatabaseKind::Meta => vec![self.meta()],
            DatabaseKind::ModelCache => vec![self.model_cache()],
            DatabaseKind::Logs => vec![Arc::clone(&self.logs)],
            DatabaseKind::Summaries => Vec::new(),
        };
        if let Ok(lazy) = self.lazy.lock() {
            for (address, tier) in lazy.iter() {
                if address.kind == kind {
                    stores.push(Arc::clone(&tier.store));
                }
            }
        }
        stores
    }

    /// Archive bucket labels present on disk for a database.
    pub fn archive_buckets(&self, kind: DatabaseKind) -> Vec<String> {
        let dir = self
            .root
            .join(kind.name())
            .join(TemperatureTier::Archive.name());
        let mut buckets = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        buckets.push(name.to_string());
                    }
                }
            }
        }
        buckets.sort();
        buckets
    }

    // --- Degraded-state tracking ---

    /// Marks or clears the degraded flag for a database.
    pub fn set_degraded(&self, kind: DatabaseKind, degraded: bool) {
        if let Ok(mut set) = self.degraded.write() {
            if degraded {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }
    }

    /// Whether queries against this database currently run degraded.
    pub fn is_degraded(&self, kind: DatabaseKind) -> bool {
        self.degraded
            .read()
            .map(|set| set.contains(&kind))
            .unwrap_or(false)
    }

    /// Detects derived databases that are empty while their source is not,
    /// which indicates external truncation or corruption recovery.
    fn startup_health_scan(&self) -> DbResult<()> {
        let source_messages = self
            .conversations_active
            .nodes_by_property("node_type", "Message")?
            .len();
        if source_messages == 0 {
            return Ok(());
        }

        let knowledge_nodes = self.knowledge_active.node_count()?
            + self.knowledge_stable.node_count()?
            + self.knowledge_inferred.node_count()?;
        if knowledge_nodes == 0 {
            self.set_degraded(DatabaseKind::Knowledge, true);
            self.log_event("degraded", "knowledge empty while conversations non-empty");
        }

        let embedding_rows = self
            .embeddings_active
            .env()
            .table_len(indexing::config::tables::EMBEDDINGS)?;
        if embedding_rows == 0 {
            self.set_degraded(DatabaseKind::Embeddings, true);
            self.log_event("degraded", "embeddings empty while conversations non-empty");
        }

        Ok(())
    }

    /// Rebuilds the persistent indexes of a derived database and clears its
    /// degraded flag. Invoked by the scheduler's `RebuildIndex` task.
    pub fn rebuild_indexes(&self, kind: DatabaseKind) -> DbResult<()> {
        for store in self.open_stores_of(kind) {
            store.index().rebuild_structural(store.env())?;
            store.index().rebuild_graph(store.env())?;
            if kind == DatabaseKind::Embeddings {
                store.index().load_vectors(store.env())?;
            }
        }
        self.set_degraded(kind, false);
        self.log_event("rebuild", kind.name());
        Ok(())
    }

    // --- Conversations ---

    /// Inserts a chat into the active tier.
    pub fn insert_chat(&self, chat: Chat) -> DbResult<()> {
        self.conversations_active.insert_node(&Node::Chat(chat))
    }

    /// Finds a chat across the open conversation tiers.
    pub fn get_chat(&self, chat_id: &str) -> DbResult<Option<Chat>> {
        for store in self.open_stores_of(DatabaseKind::Conversations) {
            if let Some(Node::Chat(chat)) = store.get_node(chat_id)? {
                return Ok(Some(chat));
            }
        }
        Ok(None)
    }

    fn chat_store(&self, chat_id: &str) -> DbResult<Option<Arc<StorageManager>>> {
        for store in self.open_stores_of(DatabaseKind::Conversations) {
            if let Some(Node::Chat(_)) = store.get_node(chat_id)? {
                return Ok(Some(store));
            }
        }
        Ok(None)
    }

    /// Inserts a message into its chat's tier, updating the chat in the
    /// same per-environment transaction.
    ///
    /// # Errors
    ///
    /// `NotFound` (with no partial write) if the chat does not exist.
    pub fn insert_message(&self, message: Message) -> DbResult<()> {
        let store = self
            .chat_store(message.chat_id.as_str())?
            .ok_or_else(|| DbError::NotFound(format!("chat {}", message.chat_id)))?;

        let Some(Node::Chat(mut chat)) = store.get_node(message.chat_id.as_str())? else {
            return Err(DbError::NotFound(format!("chat {}", message.chat_id)));
        };
        if !chat.message_ids.contains(&message.id) {
            chat.message_ids.push(message.id.clone());
        }
        chat.updated_at = chat.updated_at.max(message.timestamp);

        store.insert_nodes(&[Node::Chat(chat), Node::Message(message)])
    }

    /// Finds a message across the open conversation tiers.
    pub fn get_message(&self, message_id: &str) -> DbResult<Option<Message>> {
        for store in self.open_stores_of(DatabaseKind::Conversations) {
            if let Some(Node::Message(message)) = store.get_node(message_id)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Messages of a chat across the open tiers, merged in timestamp order.
    pub fn iter_messages_by_chat(
        &self,
        chat_id: &str,
        time_range: Option<(i64, i64)>,
    ) -> DbResult<Vec<Message>> {
        let mut messages = Vec::new();
        for store in self.open_stores_of(DatabaseKind::Conversations) {
            messages.extend(store.messages_by_chat(chat_id, time_range)?);
        }
        messages.sort_by_key(|m| m.timestamp);
        messages.dedup_by(|a, b| a.id == b.id);
        Ok(messages)
    }

    // --- Lifecycle: demotion and promotion ---

    fn demotion_target(&self, updated_at: i64, now_ms: i64) -> Option<TierAddress> {
        let age = now_ms.saturating_sub(updated_at);
        if age > self.config.recent_window_ms() {
            Some(TierAddress::archive(
                DatabaseKind::Conversations,
                bucket_for_timestamp(updated_at),
            ))
        } else if age > self.config.active_window_ms() {
            Some(TierAddress::new(
                DatabaseKind::Conversations,
                Some(TemperatureTier::Recent),
            ))
        } else {
            None
        }
    }

    /// Demotes one chat (and all its messages) out of the active tier if its
    /// age warrants it. Returns the destination, if any.
    ///
    /// The copy into the destination tier is one transaction, and so is the
    /// removal from the source tier: per-environment atomicity, no global
    /// transaction.
    pub fn demote_chat(&self, chat_id: &str, now_ms: i64) -> DbResult<Option<TierAddress>> {
        let Some(Node::Chat(chat)) = self.conversations_active.get_node(chat_id)? else {
            return Ok(None);
        };
        let Some(target) = self.demotion_target(chat.updated_at, now_ms) else {
            return Ok(None);
        };

        let messages = self.conversations_active.messages_by_chat(chat_id, None)?;
        let target_store = self.open_tier(&target)?;

        let mut nodes: Vec<Node> = Vec::with_capacity(messages.len() + 1);
        nodes.push(Node::Chat(chat));
        nodes.extend(messages.iter().cloned().map(Node::Message));
        target_store.insert_nodes(&nodes)?;

        let mut ids: Vec<NodeId> = Vec::with_capacity(messages.len() + 1);
        ids.push(NodeId::new(chat_id));
        ids.extend(messages.iter().map(|m| m.id.clone()));
        self.conversations_active.delete_nodes(&ids)?;

        // Embeddings follow their messages into the matching tier.
        let embedding_target = TierAddress {
            kind: DatabaseKind::Embeddings,
            tier: target.tier,
            bucket: target.bucket.clone(),
        };
        let embedding_store = self.open_tier(&embedding_target)?;
        for message in &messages {
            for resolution in [Resolution::Fast384, Resolution::Accurate1536] {
                let emb_id = Embedding::id_for(resolution, &message.id);
                if let Some(embedding) = self.embeddings_active.get_embedding(emb_id.as_str())? {
                    embedding_store.insert_embedding(&embedding)?;
                    self.embeddings_active.delete_embedding(emb_id.as_str())?;
                }
            }
        }

        self.log_event(
            "demote",
            &format!("chat {chat_id} -> {:?}", target.path(&self.root)),
        );
        Ok(Some(target))
    }

    /// Demotes every active chat older than the active window. Returns the
    /// demoted chat ids. Runs from the scheduler during SleepMode.
    pub fn demote_expired_chats(&self, now_ms: i64) -> DbResult<Vec<NodeId>> {
        let chat_ids = self
            .conversations_active
            .nodes_by_property("node_type", "Chat")?;
        let mut demoted = Vec::new();
        for chat_id in chat_ids {
            if self.demote_chat(chat_id.as_str(), now_ms)?.is_some() {
                demoted.push(chat_id);
            }
        }
        Ok(demoted)
    }

    /// Moves a chat (and its messages and embeddings) back to the active
    /// tier. The inverse of [`Self::demote_chat`].
    pub fn promote_chat(&self, chat_id: &str) -> DbResult<bool> {
        // Locate the chat in a non-active tier; check recent, then archives.
        let mut candidates = vec![TierAddress::new(
            DatabaseKind::Conversations,
            Some(TemperatureTier::Recent),
        )];
        for bucket in self.archive_buckets(DatabaseKind::Conversations) {
            candidates.push(TierAddress::archive(DatabaseKind::Conversations, bucket));
        }

        for address in candidates {
            if !address.path(&self.root).exists() {
                continue;
            }
            let store = self.open_tier(&address)?;
            let Some(Node::Chat(chat)) = store.get_node(chat_id)? else {
                continue;
            };

            let messages = store.messages_by_chat(chat_id, None)?;
            let mut nodes: Vec<Node> = Vec::with_capacity(messages.len() + 1);
            nodes.push(Node::Chat(chat));
            nodes.extend(messages.iter().cloned().map(Node::Message));
            self.conversations_active.insert_nodes(&nodes)?;

            let mut ids: Vec<NodeId> = Vec::with_capacity(messages.len() + 1);
            ids.push(NodeId::new(chat_id));
            ids.extend(messages.iter().map(|m| m.id.clone()));
            store.delete_nodes(&ids)?;

            let embedding_address = TierAddress {
                kind: DatabaseKind::Embeddings,
                tier: address.tier,
                bucket: address.bucket.clone(),
            };
            if embedding_address.path(&self.root).exists() {
                let embedding_store = self.open_tier(&embedding_address)?;
                for message in &messages {
                    for resolution in [Resolution::Fast384, Resolution::Accurate1536] {
                        let emb_id = Embedding::id_for(resolution, &message.id);
                        if let Some(embedding) = embedding_store.get_embedding(emb_id.as_str())? {
                            self.embeddings_active.insert_embedding(&embedding)?;
                            embedding_store.delete_embedding(emb_id.as_str())?;
                        }
                    }
                }
            }

            self.log_event("promote", &format!("chat {chat_id} -> active"));
            return Ok(true);
        }

        Ok(false)
    }

    // --- Knowledge ---

    fn knowledge_store_for(&self, status: EntityStatus) -> Arc<StorageManager> {
        match status {
            EntityStatus::Inferred => self.knowledge_inferred(),
            EntityStatus::Active => self.knowledge_active(),
            EntityStatus::Stable => self.knowledge_stable(),
        }
    }

    /// Inserts an entity into the tier matching its status.
    pub fn insert_entity(&self, entity: Entity) -> DbResult<()> {
        self.knowledge_store_for(entity.status)
            .insert_node(&Node::Entity(entity))
    }

    /// Finds an entity by id across active, stable, then inferred.
    pub fn get_entity(&self, entity_id: &str) -> DbResult<Option<Entity>> {
        for store in [
            self.knowledge_active(),
            self.knowledge_stable(),
            self.knowledge_inferred(),
        ] {
            if let Some(Node::Entity(entity)) = store.get_node(entity_id)? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Finds an entity by `(label, entity_type)` across the knowledge tiers.
    pub fn find_entity(&self, label: &str, entity_type: &str) -> DbResult<Option<Entity>> {
        for store in [
            self.knowledge_active(),
            self.knowledge_stable(),
            self.knowledge_inferred(),
        ] {
            for id in store.nodes_by_property("label", label)? {
                if let Some(Node::Entity(entity)) = store.get_node(id.as_str())? {
                    if entity.entity_type == entity_type {
                        return Ok(Some(entity));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Deterministic entity id for a `(label, entity_type)` pair.
    pub fn entity_id_for(label: &str, entity_type: &str) -> NodeId {
        let slug: String = label
            .to_lowercase()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        NodeId::new(format!("ent:{}:{}", entity_type.to_lowercase(), slug))
    }

    /// Finds-or-creates the entity for `(label, entity_type)` and bumps its
    /// mention count. Serialized across callers so concurrent extractions
    /// of the same label never duplicate the entity.
    pub fn record_entity_mention(
        &self,
        label: &str,
        entity_type: &str,
        confidence: f32,
        now_ms: i64,
    ) -> DbResult<Entity> {
        let _guard = self.entity_lock.lock().map_err(poisoned)?;

        let entity = match self.find_entity(label, entity_type)? {
            Some(mut entity) => {
                entity.mention_count += 1;
                entity.confidence = entity.confidence.max(confidence);
                entity
            }
            None => Entity {
                id: Self::entity_id_for(label, entity_type),
                label: label.to_string(),
                entity_type: entity_type.to_string(),
                status: EntityStatus::Inferred,
                first_seen_at: now_ms,
                mention_count: 1,
                confidence,
                metadata: serde_json::json!({}),
            },
        };

        self.knowledge_store_for(entity.status)
            .insert_node(&Node::Entity(entity.clone()))?;
        Ok(entity)
    }

    /// Promotes an entity across tiers when its mention count crosses the
    /// thresholds (3 -> active, 10 -> stable). Returns the new status if a
    /// move happened.
    pub fn promote_entity(&self, entity_id: &str) -> DbResult<Option<EntityStatus>> {
        let Some(entity) = self.get_entity(entity_id)? else {
            return Ok(None);
        };

        let target = match entity.status {
            EntityStatus::Inferred if entity.mention_count >= 3 => EntityStatus::Active,
            EntityStatus::Active if entity.mention_count >= 10 => EntityStatus::Stable,
            _ => return Ok(None),
        };

        self.knowledge_store_for(entity.status)
            .delete_node(entity_id)?;
        let mut promoted = entity;
        promoted.status = target;
        self.knowledge_store_for(target)
            .insert_node(&Node::Entity(promoted))?;

        self.log_event(
            "promote_entity",
            &format!("{entity_id} -> {}", target.name()),
        );
        Ok(Some(target))
    }

    /// Inserts an edge into the active knowledge tier.
    pub fn insert_edge(&self, edge: Edge) -> DbResult<()> {
        self.knowledge_active.insert_edge(&edge)
    }

    /// Finds an edge across the knowledge tiers.
    pub fn get_edge(&self, edge_id: &str) -> DbResult<Option<Edge>> {
        for store in self.open_stores_of(DatabaseKind::Knowledge) {
            if let Some(edge) = store.get_edge(edge_id)? {
                return Ok(Some(edge));
            }
        }
        Ok(None)
    }

    /// Deletes an edge from whichever knowledge tier holds it.
    pub fn delete_edge(&self, edge_id: &str) -> DbResult<Option<Edge>> {
        for store in self.open_stores_of(DatabaseKind::Knowledge) {
            if let Some(edge) = store.delete_edge(edge_id)? {
                return Ok(Some(edge));
            }
        }
        Ok(None)
    }

    // --- Embeddings ---

    /// Inserts an embedding into the active embeddings tier.
    pub fn insert_embedding(&self, embedding: Embedding) -> DbResult<()> {
        self.embeddings_active.insert_embedding(&embedding)
    }

    /// Finds an embedding across the open embeddings tiers.
    pub fn get_embedding(&self, embedding_id: &str) -> DbResult<Option<Embedding>> {
        for store in self.open_stores_of(DatabaseKind::Embeddings) {
            if let Some(embedding) = store.get_embedding(embedding_id)? {
                return Ok(Some(embedding));
            }
        }
        Ok(None)
    }

    // --- Tool results ---

    /// Caches a tool result.
    pub fn insert_tool_result(&self, result: ToolResult) -> DbResult<()> {
        self.tool_results.insert_node(&Node::ToolResult(result))
    }

    /// Fetches a cached tool result; stale entries are returned (the caller
    /// decides whether to re-fetch).
    pub fn get_tool_result(&self, id: &str) -> DbResult<Option<ToolResult>> {
        match self.tool_results.get_node(id)? {
            Some(Node::ToolResult(result)) => Ok(Some(result)),
            _ => Ok(None),
        }
    }

    // --- Experience ---

    /// Records an action outcome. Outcomes are append-only.
    ///
    /// # Errors
    ///
    /// `Conflict` if an outcome with the same id already exists.
    pub fn insert_action_outcome(&self, outcome: ActionOutcome) -> DbResult<()> {
        if self.experience.get_node(outcome.id.as_str())?.is_some() {
            return Err(DbError::Conflict(format!(
                "action outcome {} already recorded",
                outcome.id
            )));
        }
        self.experience.insert_node(&Node::ActionOutcome(outcome))
    }

    /// Fetches an action outcome.
    pub fn get_action_outcome(&self, id: &str) -> DbResult<Option<ActionOutcome>> {
        match self.experience.get_node(id)? {
            Some(Node::ActionOutcome(outcome)) => Ok(Some(outcome)),
            _ => Ok(None),
        }
    }

    /// Records user feedback as a separate record referencing the outcome.
    ///
    /// # Errors
    ///
    /// `NotFound` if the referenced outcome does not exist.
    pub fn insert_feedback(&self, feedback: UserFeedback) -> DbResult<()> {
        if self
            .experience
            .get_node(feedback.outcome_id.as_str())?
            .is_none()
        {
            return Err(DbError::NotFound(format!(
                "action outcome {}",
                feedback.outcome_id
            )));
        }
        self.experience.insert_node(&Node::UserFeedback(feedback))
    }

    /// All feedback recorded for an outcome.
    pub fn feedback_for_outcome(&self, outcome_id: &str) -> DbResult<Vec<UserFeedback>> {
        let ids = self
            .experience
            .nodes_by_property("outcome_id", outcome_id)?;
        let mut feedback = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(Node::UserFeedback(f)) = self.experience.get_node(id.as_str())? {
                feedback.push(f);
            }
        }
        feedback.sort_by_key(|f| f.timestamp);
        Ok(feedback)
    }

    /// Recent action outcomes of one action type, newest first, capped at
    /// `limit`.
    pub fn recent_outcomes(&self, action_type: &str, limit: usize) -> DbResult<Vec<ActionOutcome>> {
        let ids = self
            .experience
            .nodes_by_property("action_type", action_type)?;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(Node::ActionOutcome(outcome)) = self.experience.get_node(id.as_str())? {
                outcomes.push(outcome);
            }
        }
        outcomes.sort_by_key(|o| std::cmp::Reverse(o.timestamp));
        outcomes.truncate(limit);
        Ok(outcomes)
    }

    /// Inserts or updates an aggregated pattern.
    pub fn upsert_pattern(&self, pattern: Pattern) -> DbResult<()> {
        self.experience.insert_node(&Node::Pattern(pattern))
    }

    /// All patterns of a kind.
    pub fn patterns_by_kind(&self, kind: PatternKind) -> DbResult<Vec<Pattern>> {
        let ids = self
            .experience
            .nodes_by_property("pattern_kind", kind.name())?;
        let mut patterns = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(Node::Pattern(pattern)) = self.experience.get_node(id.as_str())? {
                patterns.push(pattern);
            }
        }
        Ok(patterns)
    }

    // --- Summaries ---

    /// The lazily opened summaries environment for a scope.
    pub fn summaries_store(&self, scope: SummaryScope) -> DbResult<Arc<StorageManager>> {
        let tier = match scope {
            SummaryScope::Session => TemperatureTier::Session,
            SummaryScope::Daily => TemperatureTier::Daily,
            SummaryScope::Weekly => TemperatureTier::Weekly,
            SummaryScope::Monthly => TemperatureTier::Monthly,
        };
        self.open_tier(&TierAddress::new(DatabaseKind::Summaries, Some(tier)))
    }

    /// Writes a summary into its scope's environment.
    pub fn insert_summary(&self, summary: Summary) -> DbResult<()> {
        self.summaries_store(summary.scope)?
            .insert_node(&Node::Summary(summary))
    }

    /// Summaries of a scope overlapping `[start_ms, end_ms]`.
    pub fn summaries_in_range(
        &self,
        scope: SummaryScope,
        start_ms: i64,
        end_ms: i64,
    ) -> DbResult<Vec<Summary>> {
        let store = self.summaries_store(scope)?;
        let mut summaries = Vec::new();
        for node in store.iter_nodes()? {
            if let Node::Summary(summary) = node {
                if summary.end_ts >= start_ms && summary.start_ts <= end_ms {
                    summaries.push(summary);
                }
            }
        }
        summaries.sort_by_key(|s| s.start_ts);
        Ok(summaries)
    }

    // --- Consistency scans ---

    /// Messages in the active tier that lack a fast embedding. The startup
    /// wiring enqueues `EmbedFast` for each (Scenario F recovery).
    pub fn scan_missing_fast_embeddings(&self) -> DbResult<Vec<(NodeId, String)>> {
        let ids = self
            .conversations_active
            .nodes_by_property("node_type", "Message")?;
        let mut missing = Vec::new();
        for id in ids {
            let emb_id = Embedding::id_for(Resolution::Fast384, &id);
            if self
                .embeddings_active
                .get_embedding(emb_id.as_str())?
                .is_none()
            {
                if let Some(Node::Message(message)) =
                    self.conversations_active.get_node(id.as_str())?
                {
                    missing.push((id, message.text_content));
                }
            }
        }
        Ok(missing)
    }

    /// Recounts `mention_count` from MENTIONS edges and rewrites entities
    /// whose counter drifted. Returns the number of corrections.
    pub fn reconcile_mentions(&self) -> DbResult<usize> {
        let mut corrected = 0;
        for store in [
            self.knowledge_active(),
            self.knowledge_stable(),
            self.knowledge_inferred(),
        ] {
            for node in store.iter_nodes()? {
                let Node::Entity(mut entity) = node else {
                    continue;
                };
                let mut count = 0u64;
                // MENTIONS edges live in the active knowledge tier.
                for (edge_id, _) in self.knowledge_active.incoming(entity.id.as_str())? {
                    if let Some(edge) = self.knowledge_active.get_edge(edge_id.as_str())? {
                        if edge.relation_type == common::models::relation::MENTIONS {
                            count += 1;
                        }
                    }
                }
                if entity.mention_count != count {
                    entity.mention_count = count;
                    store.insert_node(&Node::Entity(entity))?;
                    corrected += 1;
                }
            }
        }
        Ok(corrected)
    }

    // --- Telemetry ---

    /// Appends a lossy system event to the logs database.
    pub fn log_event(&self, kind: &str, message: &str) {
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{:020}:{:06}", common::now_ms(), seq);
        let record = serde_json::json!({
            "kind": kind,
            "message": message,
            "at": common::now_ms(),
        });
        let value = record.to_string();
        if let Err(err) = self
            .logs
            .env()
            .put("events", key.as_bytes(), value.as_bytes())
        {
            log::debug!("telemetry write dropped: {err}");
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> DbError {
    DbError::Other("lock poisoned".to_string())
}
