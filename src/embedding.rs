//! Embedding providers and batch orchestration.
//!
//! [`Embedder`] is the seam between the sync pipeline and the embedding
//! backend. Two HTTP providers are included:
//! - **[`OpenAiEmbedder`]** — `POST /v1/embeddings` with bearer auth.
//! - **[`OllamaEmbedder`]** — a local Ollama instance's `/api/embed` endpoint.
//!
//! Both retry transient failures with exponential backoff: HTTP 429 and 5xx
//! retry, other 4xx fail immediately, network errors retry. Backoff is
//! 1s, 2s, 4s, ... capped at 32s.
//!
//! [`embed_in_batches`] drives a provider over an arbitrary text list in
//! fixed-size sub-batches, preserving input order. A sub-batch failure
//! carries the item range that failed; earlier sub-batches are unaffected.
//!
//! Vectors are stored in SQLite as little-endian f32 BLOBs via
//! [`vec_to_blob`] / [`blob_to_vec`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

/// An embedding backend. Implementations embed one sub-batch at a time;
/// batching across a whole document is handled by [`embed_in_batches`].
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    ///
    /// The error's item range is relative to this batch; callers rebase it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Instantiate the provider named in the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed `texts` in sub-batches of `batch_size`, preserving input order.
///
/// Identical texts within a sub-batch are sent to the backend once and the
/// resulting vector is fanned back out. Returned vectors are validated
/// against the provider's declared dimensionality.
pub async fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut out = Vec::with_capacity(texts.len());

    for (batch_no, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        let offset = batch_no * batch_size.max(1);
        let range_err = |details: String| EmbedError {
            start: offset,
            end: offset + batch.len(),
            details,
        };

        // Collapse duplicate texts so the backend sees each once.
        let mut unique: Vec<String> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut positions: Vec<usize> = Vec::with_capacity(batch.len());
        for text in batch {
            let idx = *seen.entry(text.as_str()).or_insert_with(|| {
                unique.push(text.clone());
                unique.len() - 1
            });
            positions.push(idx);
        }

        let vectors = embedder
            .embed_batch(&unique)
            .await
            .map_err(|e| range_err(e.details))?;

        if vectors.len() != unique.len() {
            return Err(range_err(format!(
                "backend returned {} vectors for {} inputs",
                vectors.len(),
                unique.len()
            )));
        }
        for v in &vectors {
            if v.len() != embedder.dims() {
                return Err(range_err(format!(
                    "backend returned {}-dim vector, expected {}",
                    v.len(),
                    embedder.dims()
                )));
            }
        }

        for idx in positions {
            out.push(vectors[idx].clone());
        }
    }

    Ok(out)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

// ============ OpenAI ============

/// Embedding provider for the OpenAI embeddings API.
///
/// The API key comes from config or the `OPENAI_API_KEY` environment
/// variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for OpenAI provider")?;
        let api_key = match config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        {
            Some(key) => key,
            None => bail!(
                "OpenAI API key not set: provide embedding.api_key or OPENAI_API_KEY"
            ),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims: config.dims,
            api_key,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let batch_err = |details: String| EmbedError {
            start: 0,
            end: texts.len(),
            details,
        };

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| batch_err(e.to_string()))?;
                        return parse_openai_response(&json).map_err(batch_err);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(batch_err(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(batch_err(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "invalid OpenAI response: missing data array".to_string())?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| "invalid OpenAI response: missing embedding".to_string())?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama ============

/// Embedding provider for a local Ollama instance.
///
/// Requires an embedding model pulled (e.g. `ollama pull all-minilm`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for Ollama provider")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims: config.dims,
            url,
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let batch_err = |details: String| EmbedError {
            start: 0,
            end: texts.len(),
            details,
        };

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| batch_err(e.to_string()))?;
                        return parse_ollama_response(&json).map_err(batch_err);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(batch_err(format!(
                        "Ollama API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ));
                    continue;
                }
            }
        }

        Err(batch_err(
            last_err.unwrap_or_else(|| "Ollama embedding failed after retries".to_string()),
        ))
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| "invalid Ollama response: missing embeddings array".to_string())?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| "invalid Ollama response: embedding is not an array".to_string())?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ BLOB encoding ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
