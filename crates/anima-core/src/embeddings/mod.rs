//! Embedding client — batches text into fixed-dimension vectors via an
//! OpenAI-compatible embeddings endpoint.

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::AnimaError;

/// Unified embedding seam. Process-wide client, injected into components.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embedding vector dimension; must match the index's declared dimension.
    fn dimension(&self) -> usize;

    /// Embed an ordered batch. Returns one vector per input, in order.
    /// Batches of unbounded size are transparently split to honor the
    /// upstream per-request limit; partial failures fail the whole batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnimaError>;

    /// Embed a single search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AnimaError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AnimaError::EmbeddingFailure("empty embedding response".into()))
    }
}

pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    max_batch_size: usize,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, AnimaError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| AnimaError::Internal(anyhow!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            max_batch_size: config.max_batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnimaError> {
        let request = json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&request).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.transient && attempt <= self.max_retries => {
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt - 1));
                    tracing::warn!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e.message,
                        "Transient embedding failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(AnimaError::EmbeddingFailure(e.message)),
            }
        }
    }

    async fn send_once(&self, request: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| EmbedError {
            transient: e.is_timeout() || e.is_connect(),
            message: format!("request to {} failed: {}", self.endpoint, e),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(EmbedError {
                transient: status.is_server_error() || status.as_u16() == 429,
                message: format!("embedding API error ({}): {}", status, preview),
            });
        }

        let parsed: EmbeddingsResponse = response.json().await.map_err(|e| EmbedError {
            transient: false,
            message: format!("malformed embedding response: {}", e),
        })?;

        let expected = request["input"].as_array().map(|a| a.len()).unwrap_or(0);
        if parsed.data.len() != expected {
            return Err(EmbedError {
                transient: false,
                message: format!(
                    "embedding response has {} rows, expected {}",
                    parsed.data.len(),
                    expected
                ),
            });
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        for row in &rows {
            if row.embedding.len() != self.dimension {
                return Err(EmbedError {
                    transient: false,
                    message: format!(
                        "embedding dimension {} does not match declared {}",
                        row.embedding.len(),
                        self.dimension
                    ),
                });
            }
        }

        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

struct EmbedError {
    transient: bool,
    message: String,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AnimaError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.max_batch_size) {
            vectors.extend(self.embed_request(window).await?);
        }
        Ok(vectors)
    }
}
