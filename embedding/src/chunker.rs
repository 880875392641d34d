//! Text chunking and pooling for the embedding pipeline.
//!
//! Long inputs are split into chunks of at most `max_tokens` (approximated
//! at one token per whitespace-separated word), embedded separately, and
//! mean-pooled back into a single vector.

/// Rough token count: whitespace words.
pub fn approx_token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Splits `text` into chunks of at most `max_tokens` words, preferring
/// sentence boundaries where they land inside the budget.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    if approx_token_count(text) <= max_tokens {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0;

    for sentence in split_sentences(text) {
        let sentence_len = approx_token_count(sentence);

        if sentence_len > max_tokens {
            // A single oversized sentence: flush and hard-split by words.
            if !current.is_empty() {
                chunks.push(current.join(" "));
                current.clear();
                current_len = 0;
            }
            let words: Vec<&str> = sentence.split_whitespace().collect();
            for window in words.chunks(max_tokens) {
                chunks.push(window.join(" "));
            }
            continue;
        }

        if current_len + sentence_len > max_tokens && !current.is_empty() {
            chunks.push(current.join(" "));
            current.clear();
            current_len = 0;
        }
        current.push(sentence);
        current_len += sentence_len;
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let end = idx + ch.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Mean-pools chunk vectors into one vector of the same dimension.
///
/// Empty input yields an empty vector; the caller treats that as "nothing
/// to embed".
pub fn mean_pool(vectors: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let mut pooled = vec![0.0f32; dim];
    for vector in vectors {
        for (slot, value) in pooled.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }
    let n = vectors.len() as f32;
    for slot in pooled.iter_mut() {
        *slot /= n;
    }
    pooled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_text("Hello world", 512);
        assert_eq!(chunks, vec!["Hello world".to_string()]);
    }

    #[test]
    fn test_long_text_splits_on_sentences() {
        let text = "First sentence here. Second sentence follows. Third one ends it.";
        let chunks = chunk_text(text, 6);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(approx_token_count(chunk) <= 6);
        }
    }

    #[test]
    fn test_oversized_sentence_hard_splits() {
        let words = vec!["word"; 50].join(" ");
        let chunks = chunk_text(&words, 10);
        assert_eq!(chunks.len(), 5);
        for chunk in &chunks {
            assert_eq!(approx_token_count(chunk), 10);
        }
    }

    #[test]
    fn test_mean_pool() {
        let pooled = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(pooled, vec![0.5, 0.5]);

        assert!(mean_pool(&[]).is_empty());
    }
}
