//! Embedding providers and vector helpers.
//!
//! All vectors produced here are L2-normalized, so cosine similarity
//! reduces to a dot product downstream. Provider failures surface as
//! [`MatchError::CapabilityUnavailable`] and callers degrade rather than
//! fail: ingestion proceeds without embeddings, matching falls back to
//! structured-only scoring.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{MatchError, Result};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, each L2-normalized.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "stub" => Ok(Arc::new(StubProvider::new(config.dims))),
        "openai" => {
            let model = config
                .model
                .clone()
                .ok_or_else(|| MatchError::Validation("embedding.model is required for openai".into()))?;
            Ok(Arc::new(OpenAIProvider::new(
                model,
                config.dims,
                config.max_retries,
                config.timeout_secs,
            )?))
        }
        other => Err(MatchError::Validation(format!(
            "unknown embedding provider: '{}'",
            other
        ))),
    }
}

/// Placeholder when no embedding backend is configured. Every call reports
/// the capability as unavailable, which triggers graceful degradation.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(MatchError::CapabilityUnavailable(
            "embedding provider is disabled".into(),
        ))
    }
}

/// Deterministic offline provider for tests and local development: a
/// bag-of-words hash into `dims` buckets. Similar texts share tokens and
/// so land near each other, which is enough to exercise retrieval.
pub struct StubProvider {
    dims: usize,
}

impl StubProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(token) as usize) % self.dims;
            v[bucket] += 1.0;
        }
        normalize_vec(&mut v);
        v
    }
}

// FNV-1a; std's DefaultHasher is not stable across releases and these
// vectors are persisted.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// OpenAI-compatible embeddings API client with bounded exponential
/// backoff on transient failures.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAIProvider {
    pub fn new(model: String, dims: usize, max_retries: u32, timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            MatchError::CapabilityUnavailable(
                "OPENAI_API_KEY environment variable not set".into(),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| MatchError::CapabilityUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model,
            dims,
            max_retries,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let detail = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp
                            .json()
                            .await
                            .map_err(|e| MatchError::CapabilityUnavailable(e.to_string()))?;
                        let mut data = parsed.data;
                        data.sort_by_key(|d| d.index);
                        let mut vectors: Vec<Vec<f32>> =
                            data.into_iter().map(|d| d.embedding).collect();
                        for v in &mut vectors {
                            normalize_vec(v);
                        }
                        if vectors.len() != texts.len() {
                            return Err(MatchError::CapabilityUnavailable(format!(
                                "embedding count mismatch: sent {}, got {}",
                                texts.len(),
                                vectors.len()
                            )));
                        }
                        return Ok(vectors);
                    }
                    // 429 and 5xx are transient; other client errors are not.
                    if status.as_u16() != 429 && !status.is_server_error() {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(MatchError::CapabilityUnavailable(format!(
                            "embedding API returned {}: {}",
                            status, text
                        )));
                    }
                    format!("status {}", status)
                }
                Err(e) => e.to_string(),
            };

            if attempt > self.max_retries {
                return Err(MatchError::CapabilityUnavailable(format!(
                    "embedding API failed after {} attempts: {}",
                    attempt, detail
                )));
            }
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            warn!(attempt, ?delay, %detail, "embedding request failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ---- Vector helpers ----

pub fn normalize_vec(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in [-1, 1]. Inputs are expected normalized; this still
/// divides by the norms so un-normalized callers get a correct answer.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Mean of equally weighted vectors, re-normalized.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dims = first.len();
    let mut acc = vec![0.0f32; dims];
    for v in vectors {
        if v.len() != dims {
            return None;
        }
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
    }
    let n = vectors.len() as f32;
    for a in acc.iter_mut() {
        *a /= n;
    }
    normalize_vec(&mut acc);
    Some(acc)
}

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(v.len() * 4);
    for x in v {
        blob.extend_from_slice(&x.to_le_bytes());
    }
    blob
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_is_deterministic_and_normalized() {
        let p = StubProvider::new(64);
        let a = p.embed(&["calm lazy beagle".to_string()]).await.unwrap();
        let b = p.embed(&["calm lazy beagle".to_string()]).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_stub_similar_texts_score_higher() {
        let p = StubProvider::new(128);
        let vs = p
            .embed(&[
                "calm gentle senior beagle good with cats".to_string(),
                "calm gentle senior dog good with cats".to_string(),
                "high energy young husky needs running".to_string(),
            ])
            .await
            .unwrap();
        let close = cosine_similarity(&vs[0], &vs[1]);
        let far = cosine_similarity(&vs[0], &vs[2]);
        assert!(close > far);
    }

    #[tokio::test]
    async fn test_disabled_provider_reports_unavailable() {
        let p = DisabledProvider;
        let err = p.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, MatchError::CapabilityUnavailable(_)));
    }

    #[test]
    fn test_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn test_mean_vector_normalized() {
        let m = mean_vector(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let norm: f32 = m.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((m[0] - m[1]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identity() {
        let v = vec![0.6f32, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&v, &[0.0, 0.0]), 0.0);
    }
}
