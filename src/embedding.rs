//! Embedding providers and vector utilities.
//!
//! - **[`OpenAIEmbeddings`]**: calls `POST {url}/v1/embeddings` with one batch per call.
//! - **[`HashEmbeddings`]**: deterministic bag-of-words hashing; no network.
//!   Used by tests and offline runs.
//!
//! [`embedding_dimension`] owns the model → dimensionality table that the
//! index manager uses to keep collections consistent with the configured model.
//! No retry or backoff: a failed call surfaces to the caller.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

/// Dimensionality used for models missing from the table.
pub const DEFAULT_DIMENSION: usize = 1536;

/// Vector size produced by a named embedding model.
///
/// | Model | Dims |
/// |-------|------|
/// | `text-embedding-3-small` | 1536 |
/// | `text-embedding-3-large` | 3072 |
/// | `text-embedding-ada-002` | 1536 |
/// | `text-embedding-002` | 1536 |
/// | anything else | 1536 |
pub fn embedding_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        "text-embedding-002" => 1536,
        _ => DEFAULT_DIMENSION,
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ OpenAI ============

pub struct OpenAIEmbeddings {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAIEmbeddings {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI embeddings error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let embeddings = parse_openai_response(&json)?;
        if embeddings.len() != texts.len() {
            bail!(
                "OpenAI returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            );
        }
        tracing::debug!(model = %self.model, count = embeddings.len(), "embedded batch");
        Ok(embeddings)
    }
}

/// Extracts `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Hashing ============

/// Feature-hashing embedder: each lowercase alphanumeric token adds 1.0 to
/// one of `dims` buckets, then the vector is L2-normalized.
///
/// Texts sharing words land close in cosine space, which is enough for
/// deterministic tests and keyword-style retrieval without an API key.
pub struct HashEmbeddings {
    model: String,
    dims: usize,
}

impl HashEmbeddings {
    /// Uses the table dimension for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let dims = embedding_dimension(&model);
        Self { model, dims }
    }

    pub fn with_dims(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            v[index] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
