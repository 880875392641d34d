//! ML bridge capability required by the memory core.
//!
//! The core never runs models itself; it consumes embedding, NER,
//! summarization, and reranking through this narrow trait. Transports supply
//! a real implementation backed by whatever runtime they ship; the core only
//! depends on the value types below.

use crate::models::Resolution;
use crate::{DbError, DbResult};

/// Interface for ML model inference functions.
///
/// Implementations are expected to be `Send + Sync` so the bridge can be
/// shared across the weaver workers and the query path.
#[async_trait::async_trait]
pub trait MlBridge: Send + Sync {
    /// Generate a vector embedding for the given text at the requested
    /// resolution.
    ///
    /// The returned vector must have exactly `resolution.dim()` elements;
    /// callers normalize before persisting.
    async fn generate_embedding(&self, resolution: Resolution, text: &str) -> DbResult<Vec<f32>>;

    /// Extract named entities from text.
    async fn extract_entities(&self, text: &str) -> DbResult<Vec<ExtractedEntity>>;

    /// Summarize a list of message texts into one paragraph.
    async fn summarize(&self, messages: &[String]) -> DbResult<String>;

    /// Score (query, candidate) pairs with a cross-encoder.
    ///
    /// Returns `(id, score)` pairs; higher scores are better. Order of the
    /// output is unspecified.
    async fn rerank(&self, query: &str, candidates: &[(String, String)])
        -> DbResult<Vec<(String, f32)>>;

    /// Check if the bridge is healthy and responsive.
    async fn health_check(&self) -> DbResult<bool>;
}

/// An entity span produced by NER.
#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    /// The text span of the entity.
    pub text: String,
    /// The entity type/label (e.g., "PERSON", "ORG", "GPE").
    pub label: String,
    /// Start character position in the original text.
    pub start: usize,
    /// End character position in the original text.
    pub end: usize,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,
}

/// A deterministic mock implementation for testing without a model runtime.
///
/// Embeddings are hash-derived and normalized, entities are capitalized
/// words, summaries quote the first and last message. Deterministic output
/// makes query-pipeline tests repeatable.
pub struct MockMlBridge;

#[async_trait::async_trait]
impl MlBridge for MockMlBridge {
    async fn generate_embedding(&self, resolution: Resolution, text: &str) -> DbResult<Vec<f32>> {
        let dim = resolution.dim();
        let mut vec = vec![0.0f32; dim];

        for (i, byte) in text.bytes().enumerate() {
            vec[(i * 31 + byte as usize) % dim] += (byte as f32) / 255.0;
        }

        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut vec {
                *val /= magnitude;
            }
        }

        Ok(vec)
    }

    async fn extract_entities(&self, text: &str) -> DbResult<Vec<ExtractedEntity>> {
        let mut entities = Vec::new();
        let mut start = 0;

        for word in text.split_whitespace() {
            if let Some(first_char) = word.chars().next() {
                if first_char.is_uppercase() && word.len() > 2 {
                    let clean: String = word
                        .trim_matches(|c: char| !c.is_alphanumeric())
                        .to_string();
                    if clean.len() > 2 {
                        entities.push(ExtractedEntity {
                            text: clean.clone(),
                            label: "CONCEPT".to_string(),
                            start,
                            end: start + clean.len(),
                            confidence: 0.9,
                        });
                    }
                }
            }
            start += word.len() + 1;
        }

        Ok(entities)
    }

    async fn summarize(&self, messages: &[String]) -> DbResult<String> {
        if messages.is_empty() {
            return Ok("No messages to summarize.".to_string());
        }

        if messages.len() == 1 {
            return Ok(format!("Summary: {}", &messages[0]));
        }

        Ok(format!(
            "Conversation starting with '{}' and ending with '{}'.",
            messages.first().unwrap(),
            messages.last().unwrap()
        ))
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> DbResult<Vec<(String, f32)>> {
        // Token-overlap scoring: deterministic and monotone in shared words.
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if query_words.is_empty() {
            return Err(DbError::Invalid("empty rerank query".to_string()));
        }

        Ok(candidates
            .iter()
            .map(|(id, text)| {
                let text_lower = text.to_lowercase();
                let overlap = query_words
                    .iter()
                    .filter(|w| text_lower.contains(w.as_str()))
                    .count();
                (id.clone(), overlap as f32 / query_words.len() as f32)
            })
            .collect())
    }

    async fn health_check(&self) -> DbResult<bool> {
        Ok(true)
    }
}
