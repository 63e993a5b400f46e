//! Embedding provider trait and implementations.
//!
//! This module defines the interface for generating embeddings and an
//! HTTP provider for any OpenAI-compatible `/embeddings` endpoint
//! (Ollama, LM Studio, OpenAI, OpenRouter).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during embedding generation.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("API request failed ({status}): {body}")]
    ApiError { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited after {0} retries")]
    RateLimited(u32),

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
/// The same model version must return the same vector for the same text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts in a batch
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Default endpoint: a local Ollama server.
pub const DEFAULT_EMBEDDINGS_URL: &str = "http://localhost:11434/v1/embeddings";

/// Default model served by that endpoint.
pub const DEFAULT_EMBEDDINGS_MODEL: &str = "nomic-embed-text";

/// Dimensions of [`DEFAULT_EMBEDDINGS_MODEL`].
pub const DEFAULT_EMBEDDINGS_DIMENSIONS: usize = 768;

/// Texts sent per embeddings request.
pub const DEFAULT_BATCH_SIZE: usize = 32;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Embedding provider for OpenAI-compatible HTTP APIs.
pub struct OpenAiCompatEmbeddings {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    client: Client,
    base_url: String,
}

impl OpenAiCompatEmbeddings {
    /// Create a provider for the local Ollama defaults, overridable per field.
    pub fn new(model: Option<String>, dimensions: Option<usize>) -> Self {
        Self {
            api_key: None,
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDINGS_MODEL.to_string()),
            dimensions: dimensions.unwrap_or(DEFAULT_EMBEDDINGS_DIMENSIONS),
            batch_size: DEFAULT_BATCH_SIZE,
            client: Client::new(),
            base_url: DEFAULT_EMBEDDINGS_URL.to_string(),
        }
    }

    /// Set a custom endpoint URL.
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Send a bearer token with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// POST one batch, retrying on 429 up to [`MAX_RATE_LIMIT_RETRIES`] times.
    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            debug!("POST {} ({} inputs, attempt {})", self.base_url, texts.len(), attempt + 1);

            let mut request = self.client.post(&self.base_url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    break;
                }
                let delay = retry_delay(response.headers(), attempt);
                warn!(
                    "{} rate limited the embedding request, waiting {:?}",
                    self.base_url, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(EmbeddingError::ApiError {
                    status: status.as_u16(),
                    body,
                }
                .into());
            }

            let parsed: EmbeddingResponse = response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
            return Ok(order_embeddings(parsed, texts.len())?);
        }

        Err(EmbeddingError::RateLimited(MAX_RATE_LIMIT_RETRIES).into())
    }
}

/// How long to wait before retry number `attempt + 1`: the server's
/// `retry-after` seconds if present, otherwise 1s, 2s, 4s...
fn retry_delay(headers: &HeaderMap, attempt: u32) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(1u64 << attempt.min(6)))
}

/// Put vectors back in input order and check that every input got one.
fn order_embeddings(
    response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if response.data.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            response.data.len()
        )));
    }
    let mut data = response.data;
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding returned".into()).into())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.send_request(batch).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}
