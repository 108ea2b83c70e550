// Embeddings
// Pluggable embedding providers behind one async trait. The default
// provider is a deterministic local feature-hashing model: token unigrams
// and bigrams hashed into a fixed-dimension space, TF-weighted and
// L2-normalized. It needs no model download, embeds at memory bandwidth,
// and gives stable vectors for tests; a network-backed provider can be
// swapped in behind the same trait.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::errors::CodeGraphError;

/// Configuration for embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub dimension: usize,
    pub max_batch_size: usize,
    /// Bounded retries with exponential backoff on provider failure.
    pub max_retries: usize,
    pub initial_backoff: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: "hash-ngram-v1".to_string(),
            dimension: 384,
            max_batch_size: 32,
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate an embedding for a single text.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("provider returned no embedding"))
    }

    /// Dimension of produced vectors.
    fn dimension(&self) -> usize;

    /// Model tag recorded on stored embeddings.
    fn model_name(&self) -> &str;

    fn max_batch_size(&self) -> usize;
}

/// Deterministic local provider: feature hashing over code tokens.
#[derive(Debug)]
pub struct HashEmbeddingProvider {
    config: EmbeddingConfig,
}

impl HashEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.config.dimension;
        let mut vector = vec![0.0f32; dim];
        let tokens = tokenize(text);

        for window in TokenWindows::new(&tokens) {
            let (feature, weight) = window;
            let bucket = (xxh3_64_with_seed(feature.as_bytes(), 0x5eed) as usize) % dim;
            // A second hash decides the sign, which keeps buckets from
            // collapsing into a purely additive space.
            let sign = if xxh3_64_with_seed(feature.as_bytes(), 0x517e) & 1 == 0 {
                1.0
            } else {
                -1.0
            };
            vector[bucket] += sign * weight;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

/// Wrapper adding bounded exponential-backoff retries around any provider.
pub struct BackoffEmbedder<P> {
    inner: P,
    max_retries: usize,
    initial_backoff: Duration,
}

impl<P: EmbeddingProvider> BackoffEmbedder<P> {
    pub fn new(inner: P, max_retries: usize, initial_backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            initial_backoff,
        }
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for BackoffEmbedder<P> {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0usize;
        loop {
            match self.inner.embed_texts(texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "embedding attempt failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    debug!(attempts = attempt + 1, "embedding retries exhausted");
                    return Err(CodeGraphError::EmbeddingFailed(e.to_string()).into());
                }
            }
        }
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}

/// Lowercased alphanumeric tokens, splitting camelCase and snake_case.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_numeric();
            current.extend(c.to_lowercase());
        } else {
            prev_lower = false;
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Iterator over (feature, weight) pairs: unigrams at weight 1, adjacent
/// bigrams at weight 0.5.
struct TokenWindows<'a> {
    tokens: &'a [String],
    index: usize,
    bigram: bool,
}

impl<'a> TokenWindows<'a> {
    fn new(tokens: &'a [String]) -> Self {
        Self {
            tokens,
            index: 0,
            bigram: false,
        }
    }
}

impl<'a> Iterator for TokenWindows<'a> {
    type Item = (String, f32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.bigram {
                if self.index < self.tokens.len() {
                    let token = self.tokens[self.index].clone();
                    self.index += 1;
                    return Some((token, 1.0));
                }
                self.bigram = true;
                self.index = 0;
            }
            if self.index + 1 < self.tokens.len() {
                let pair = format!("{} {}", self.tokens[self.index], self.tokens[self.index + 1]);
                self.index += 1;
                return Some((pair, 0.5));
            }
            return None;
        }
    }
}
