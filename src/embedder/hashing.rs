// embedder/hashing.rs
// Offline feature-hashing embedder: words and bigrams hashed with SHA-256 into
// signed buckets, so texts sharing vocabulary land close together. Deterministic.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{EmbeddingProvider, l2_normalize};
use crate::error::BackendError;
use crate::pipeline::keywords;

pub const DEFAULT_MODEL: &str = "feature-hash-v1";

/// Typical sentence-embedding width
pub const DEFAULT_DIMENSION: usize = 384;

const BIGRAM_WEIGHT: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Embed synchronously. The result is unit length unless the text has no
    /// characters at all.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens = keywords::tokenize(text);

        if tokens.is_empty() {
            // Emoji-only or very short text: fall back to character trigrams
            let chars: Vec<char> = text.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
            for gram in chars.windows(3.min(chars.len().max(1))) {
                let gram: String = gram.iter().collect();
                self.accumulate(&mut vector, &gram, 1.0);
            }
        } else {
            for token in &tokens {
                self.accumulate(&mut vector, token, 1.0);
            }
            for pair in tokens.windows(2) {
                let bigram = format!("{} {}", pair[0], pair[1]);
                self.accumulate(&mut vector, &bigram, BIGRAM_WEIGHT);
            }
        }

        l2_normalize(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let mut hasher = Sha256::new();
        hasher.update(feature.as_bytes());
        let hash = hasher.finalize();

        let bucket = u64::from_le_bytes([
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ]) % self.dimension as u64;
        let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };

        vector[bucket as usize] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        DEFAULT_MODEL
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(self.embed_text(text))
    }
}
