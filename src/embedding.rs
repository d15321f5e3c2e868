//! Embedding client abstraction and the HTTP implementation.
//!
//! Defines the [`Embedder`] trait and [`HttpEmbedder`], which calls an
//! OpenAI-compatible `POST {base_url}/embeddings` endpoint with batching,
//! bounded concurrency, retry, and backoff.
//!
//! Also provides vector utilities shared by the store backends:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//! - [`truncate_to_tokens`]: head-first truncation to a token budget
//!
//! # Truncation
//!
//! Long issue bodies must not make requests fail, so every input is cut to
//! `max_tokens` before it is sent. Tokens are approximated at four
//! characters each; the head of the text is kept and the remainder dropped.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{Result, RetrievalError};
use crate::http::{self, RetryPolicy};

/// Approximate chars-per-token ratio used for truncation.
const CHARS_PER_TOKEN: usize = 4;

/// Trait for embedding clients.
///
/// `embed` must return exactly one vector per input, in input order, each
/// with [`dims`](Embedder::dims) entries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embedder.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::EmbeddingFailure("empty embedding response".to_string()))
}

/// Check a batch of vectors against the expected count and dimension.
pub fn validate_vectors(vectors: &[Vec<f32>], expected_len: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected_len {
        return Err(RetrievalError::EmbeddingFailure(format!(
            "expected {} embeddings, got {}",
            expected_len,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RetrievalError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(())
}

// ============ HTTP Embedder ============

/// Embedding client for an OpenAI-compatible HTTP endpoint.
///
/// # Features
///
/// - Head-first truncation of every input to `max_tokens`
/// - Requests of `batch_size` texts, `max_concurrency` in flight
/// - Exponential backoff retry for rate limits, server errors and timeouts
/// - Optional bearer credential read from `api_key_env`
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl HttpEmbedder {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Configuration`] when a credential is
    /// required but the environment variable is unset.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.api_key();
        if api_key.is_none() && config.requires_api_key() {
            return Err(RetrievalError::Configuration(format!(
                "{} environment variable not set",
                config.api_key_env
            )));
        }

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            config: config.clone(),
            api_key,
            policy: RetryPolicy::new(config.max_retries, config.retry_base_ms),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    async fn embed_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });
        let url = self.endpoint();

        let response = http::send_with_retry(
            &self.policy,
            "embedding endpoint",
            || {
                let mut req = self.client.post(&url).json(&body);
                if let Some(key) = &self.api_key {
                    req = req.bearer_auth(key);
                }
                req
            },
            RetrievalError::EmbeddingFailure,
        )
        .await?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::EmbeddingFailure(format!(
                "embedding endpoint rejected credentials ({}): {}",
                status, body_text
            )));
        }

        let json =
            http::json_or_fail(response, "embedding endpoint", RetrievalError::EmbeddingFailure)
                .await?;
        parse_embeddings_response(&json).map_err(RetrievalError::EmbeddingFailure)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dims(&self) -> usize {
        self.config.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared: Vec<String> = texts
            .iter()
            .map(|t| {
                let cut = truncate_to_tokens(t, self.config.max_tokens);
                // The endpoint rejects empty strings.
                if cut.trim().is_empty() {
                    " ".to_string()
                } else {
                    cut
                }
            })
            .collect();

        let requests: Vec<Vec<String>> = prepared
            .chunks(self.config.batch_size)
            .map(|c| c.to_vec())
            .collect();
        debug!(
            texts = prepared.len(),
            requests = requests.len(),
            model = %self.config.model,
            "embedding batch"
        );

        // `buffered` keeps request order, so output order matches input order.
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(requests)
            .map(|chunk| self.embed_request(chunk))
            .buffered(self.config.max_concurrency)
            .try_collect()
            .await?;

        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        validate_vectors(&vectors, texts.len(), self.config.dims)?;
        Ok(vectors)
    }
}

/// Parse an OpenAI-compatible embeddings response.
///
/// Extracts the `data[].embedding` arrays and orders them by `data[].index`
/// when the endpoint provides it.
pub fn parse_embeddings_response(json: &Value) -> std::result::Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "invalid embeddings response: missing data array".to_string())?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| "invalid embeddings response: missing embedding".to_string())?;

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

/// Keep the head of `text` up to `max_tokens` (approximated), drop the rest.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_truncate_keeps_head() {
        let text = "abcdefghijkl";
        assert_eq!(truncate_to_tokens(text, 2), "abcdefgh");
        assert_eq!(truncate_to_tokens(text, 3), text);
        assert_eq!(truncate_to_tokens(text, 100), text);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ééééé";
        let cut = truncate_to_tokens(text, 1);
        assert_eq!(cut, "éééé");
    }

    #[test]
    fn test_parse_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_response_missing_data() {
        let json = serde_json::json!({ "error": "bad" });
        assert!(parse_embeddings_response(&json).is_err());
    }

    #[test]
    fn test_validate_vectors() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(validate_vectors(&vectors, 2, 2).is_ok());
        assert!(matches!(
            validate_vectors(&vectors, 2, 3),
            Err(RetrievalError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            validate_vectors(&vectors, 3, 2),
            Err(RetrievalError::EmbeddingFailure(_))
        ));
    }

    #[test]
    fn test_missing_required_key_is_configuration_error() {
        let config = EmbeddingConfig {
            api_key_env: "SIMILAR_ISSUES_TEST_UNSET_KEY".to_string(),
            require_api_key: Some(true),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            HttpEmbedder::new(&config),
            Err(RetrievalError::Configuration(_))
        ));
    }
}
