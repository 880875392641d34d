//! Embedding pipeline: multi-resolution vector generation.
//!
//! Two models serve different latency classes:
//! - fast (384-d): immediate indexing when a message lands
//! - accurate (1536-d): scheduled as low-priority background work
//!
//! plus a cross-encoder reranker for second-stage retrieval. Model execution
//! is delegated to the [`MlBridge`] capability; this crate chunks, pools,
//! normalizes, and writes the result through storage. It never owns a
//! database.

pub mod chunker;

use std::sync::Arc;

use common::bridge::MlBridge;
use common::config::CoreConfig;
use common::models::{Embedding, Resolution};
use common::{DbError, DbResult, NodeId};
use indexing::distance;
use storage::StorageManager;

/// Descriptor of one embedding model, resolved from the model-cache
/// database at startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub resolution_tag: String,
    pub dim: usize,
    pub version: String,
}

impl ModelSpec {
    fn for_resolution(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Fast384 => Self {
                name: "all-MiniLM-L6-v2".to_string(),
                resolution_tag: resolution.tag().to_string(),
                dim: resolution.dim(),
                version: "fast-v1".to_string(),
            },
            Resolution::Accurate1536 => Self {
                name: "qwen2-8b-embed".to_string(),
                resolution_tag: resolution.tag().to_string(),
                dim: resolution.dim(),
                version: "accurate-v1".to_string(),
            },
        }
    }
}

/// Multi-resolution embedding pipeline.
pub struct EmbeddingPipeline {
    bridge: Arc<dyn MlBridge>,
    config: CoreConfig,
    max_chunk_tokens: usize,
}

impl EmbeddingPipeline {
    /// Creates the pipeline around an ML bridge.
    pub fn new(bridge: Arc<dyn MlBridge>, config: CoreConfig) -> Self {
        Self {
            bridge,
            config,
            max_chunk_tokens: 512,
        }
    }

    /// Registers the model catalog in the model-cache database so restarts
    /// can detect model upgrades (a version change invalidates embeddings).
    pub fn register_models(&self, model_cache: &StorageManager) -> DbResult<()> {
        for resolution in [Resolution::Fast384, Resolution::Accurate1536] {
            let spec = ModelSpec::for_resolution(resolution);
            let bytes = serde_json::to_vec(&spec)?;
            model_cache
                .env()
                .put("models", spec.resolution_tag.as_bytes(), &bytes)?;
        }
        Ok(())
    }

    fn expected_dim(&self, resolution: Resolution) -> usize {
        match resolution {
            Resolution::Fast384 => self.config.embedding_dim_fast,
            Resolution::Accurate1536 => self.config.embedding_dim_accurate,
        }
    }

    /// Chunks, embeds, mean-pools, and L2-normalizes `text`.
    ///
    /// This is the query-time entry point: nothing is persisted.
    pub async fn embed_query(&self, resolution: Resolution, text: &str) -> DbResult<Vec<f32>> {
        let chunks = chunker::chunk_text(text, self.max_chunk_tokens);
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = self.bridge.generate_embedding(resolution, chunk).await?;
            if vector.len() != self.expected_dim(resolution) {
                return Err(DbError::Invalid(format!(
                    "model returned {} dims, expected {}",
                    vector.len(),
                    self.expected_dim(resolution)
                )));
            }
            vectors.push(vector);
        }

        let mut pooled = chunker::mean_pool(&vectors);
        if pooled.is_empty() {
            return Err(DbError::Invalid("nothing to embed".to_string()));
        }
        distance::l2_normalize(&mut pooled);
        Ok(pooled)
    }

    async fn embed_and_store(
        &self,
        store: &StorageManager,
        resolution: Resolution,
        text: &str,
        source_id: &NodeId,
    ) -> DbResult<Vec<f32>> {
        let vector = self.embed_query(resolution, text).await?;
        let spec = ModelSpec::for_resolution(resolution);
        let embedding = Embedding {
            id: Embedding::id_for(resolution, source_id),
            source_id: source_id.clone(),
            resolution,
            vector: vector.clone(),
            model_version: spec.version,
        };
        store.insert_embedding(&embedding)?;
        Ok(vector)
    }

    /// Fast-model embedding, written through the given embeddings store.
    ///
    /// The deterministic embedding id makes this idempotent: re-running for
    /// the same source replaces rather than duplicates.
    pub async fn embed_fast(
        &self,
        store: &StorageManager,
        text: &str,
        source_id: &NodeId,
    ) -> DbResult<Vec<f32>> {
        self.embed_and_store(store, Resolution::Fast384, text, source_id)
            .await
    }

    /// Accurate-model embedding, written through the given embeddings store.
    pub async fn embed_accurate(
        &self,
        store: &StorageManager,
        text: &str,
        source_id: &NodeId,
    ) -> DbResult<Vec<f32>> {
        self.embed_and_store(store, Resolution::Accurate1536, text, source_id)
            .await
    }

    /// Cross-encoder scoring of `(id, text)` candidates against `query`.
    ///
    /// Falls back to accurate-embedding cosine similarity when the bridge
    /// has no reranker. Output is sorted best-first.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> DbResult<Vec<(String, f32)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = match self.bridge.rerank(query, candidates).await {
            Ok(scores) => scores,
            Err(err) => {
                log::warn!("reranker unavailable, falling back to accurate cosine: {err}");
                let query_vec = self.embed_query(Resolution::Accurate1536, query).await?;
                let mut scores = Vec::with_capacity(candidates.len());
                for (id, text) in candidates {
                    let candidate_vec =
                        self.embed_query(Resolution::Accurate1536, text).await?;
                    scores.push((
                        id.clone(),
                        distance::cosine_similarity(&query_vec, &candidate_vec),
                    ));
                }
                scores
            }
        };

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}
