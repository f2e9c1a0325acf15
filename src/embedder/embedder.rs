//! Batch-coalescing, cache-aware wrapper around the embedding provider.
//!
//! The provider sees at most one request per batch: inputs are first split
//! into cache hits and misses, duplicate miss texts collapse to a single
//! provider input, and responses are re-ordered by the provider's `index`
//! field before being spliced back into input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheManager;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("embedding provider rejected credentials")]
    Auth,

    #[error("provider returned {got} embeddings for {expected} inputs")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Return order matches input order.
    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    fn dimensions(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

pub struct RemoteEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dim: usize,
    cache: Option<Arc<CacheManager>>,
}

impl RemoteEmbedder {
    pub fn new(
        api_base: String,
        api_key: String,
        model: String,
        dim: usize,
        cache: Option<Arc<CacheManager>>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client to build");
        Self {
            client,
            api_base,
            api_key,
            model,
            dim,
            cache,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.api_base.trim_end_matches('/'))
    }

    /// One provider round-trip, with bounded exponential retry on
    /// transient failures. Auth failures abort immediately.
    async fn call_provider(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying embedding call");
                tokio::time::sleep(backoff).await;
            }

            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(&EmbeddingRequest {
                    model: &self.model,
                    input,
                })
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(EmbedderError::Unavailable(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(EmbedderError::Auth);
            }
            if !status.is_success() {
                last_error = Some(EmbedderError::Unavailable(format!(
                    "provider returned {}",
                    status
                )));
                continue;
            }

            let parsed: EmbeddingResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    last_error = Some(EmbedderError::Unavailable(e.to_string()));
                    continue;
                }
            };

            if parsed.data.len() != input.len() {
                return Err(EmbedderError::ShapeMismatch {
                    expected: input.len(),
                    got: parsed.data.len(),
                });
            }

            // the provider is allowed to answer out of order
            let mut data = parsed.data;
            data.sort_by_key(|d| d.index);
            return Ok(data.into_iter().map(|d| d.embedding).collect());
        }

        Err(last_error.unwrap_or_else(|| EmbedderError::Unavailable("exhausted retries".into())))
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.embedding.get_embedding(text) {
                debug!(text_len = text.len(), "embedding cache hit");
                return Ok(cached);
            }
        }

        let embeddings = self.call_provider(&[text.to_owned()]).await?;
        let embedding = embeddings.into_iter().next().ok_or(EmbedderError::ShapeMismatch {
            expected: 1,
            got: 0,
        })?;

        if let Some(cache) = &self.cache {
            cache.embedding.set_embedding(text, embedding.clone());
        }
        Ok(embedding)
    }

    async fn batch_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (mut results, uncached_texts, uncached_indices) = match &self.cache {
            Some(cache) => cache.embedding.get_batch_embeddings(texts),
            None => (
                vec![None; texts.len()],
                texts.to_vec(),
                (0..texts.len()).collect(),
            ),
        };

        if uncached_texts.is_empty() {
            debug!(count = texts.len(), "all embeddings served from cache");
            return Ok(results.into_iter().map(|r| r.expect("no holes left")).collect());
        }

        // Collapse duplicate miss texts so the provider sees each one once
        let mut unique_texts = Vec::new();
        for text in &uncached_texts {
            if !unique_texts.contains(text) {
                unique_texts.push(text.clone());
            }
        }

        debug!(
            total = texts.len(),
            misses = uncached_texts.len(),
            unique = unique_texts.len(),
            "embedding batch"
        );

        let fresh = self.call_provider(&unique_texts).await?;
        let by_text: HashMap<&String, &Vec<f32>> = unique_texts.iter().zip(fresh.iter()).collect();

        if let Some(cache) = &self.cache {
            cache.embedding.set_batch_embeddings(&unique_texts, &fresh);
        }

        for (index, text) in uncached_indices.iter().zip(uncached_texts.iter()) {
            results[*index] = by_text.get(text).map(|v| (*v).clone());
        }

        results
            .into_iter()
            .map(|r| {
                r.ok_or(EmbedderError::ShapeMismatch {
                    expected: texts.len(),
                    got: 0,
                })
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.dim
    }
}
