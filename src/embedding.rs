//! Embedding providers and the embedding cache.
//!
//! Concrete implementations of the core [`Embedder`] trait:
//! - **[`DisabledEmbedder`]**: always errors; the classifier then skips
//!   straight to "no match" for texts that need similarity search.
//! - **[`NgramEmbedder`]**: deterministic hashed character-trigram vectors.
//!   Offline, no model download; the default provider.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` with retry and backoff.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed`.
//!
//! [`CachedEmbedder`] wraps any of them with a bounded `moka` cache keyed by
//! exact text.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use cbam_intake::config::EmbeddingConfig;
//! # use cbam_intake::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "ngram"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "ngram-256");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use cbam_intake_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

const DEFAULT_NGRAM_DIMS: usize = 256;

// ============ Disabled ============

/// A no-op embedder that always returns errors.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ N-gram ============

/// Hashed character-trigram embedder.
///
/// Text is lowercased, whitespace-collapsed and padded with one space on
/// each side; every character trigram is hashed into one of `dims` buckets
/// with a hash-derived sign. The vector is L2-normalized. Shared spelling
/// yields high cosine similarity regardless of word order.
pub struct NgramEmbedder {
    dims: usize,
    name: String,
}

impl NgramEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            name: format!("ngram-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let normalized: String = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let chars: Vec<char> = format!(" {} ", normalized).chars().collect();

        let mut v = vec![0.0f32; self.dims];
        for gram in chars.windows(3) {
            let key: String = gram.iter().collect();
            let digest = Sha256::digest(key.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(bytes);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for NgramEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP retry ============

/// POST `body` to `url` with retry/backoff; returns the parsed JSON body.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    tracing::warn!(service, %status, attempt, "embedding request failed; retrying");
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", service, status, body_text));
                    continue;
                }

                // Client error (not 429): don't retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", service, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", service, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", service)))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI ============

/// Embedder using the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    model: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            model,
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

// ============ Ollama ============

/// Embedder using a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            parse_vector(e)
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url.trim_end_matches('/')),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

// ============ Cache ============

/// Bounded memoization of another embedder, keyed by exact text.
///
/// Misses from one call are embedded together in a single inner call.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Arc<Vec<f32>>>> = Vec::with_capacity(texts.len());
        let mut misses: Vec<String> = Vec::new();
        for text in texts {
            let hit = self.cache.get(text).await;
            if hit.is_none() && !misses.contains(text) {
                misses.push(text.clone());
            }
            out.push(hit);
        }

        if !misses.is_empty() {
            let vectors = self.inner.embed(&misses).await?;
            if vectors.len() != misses.len() {
                bail!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    misses.len()
                );
            }
            for (text, vector) in misses.iter().zip(vectors) {
                let vector = Arc::new(vector);
                self.cache.insert(text.clone(), vector.clone()).await;
                for (slot, t) in out.iter_mut().zip(texts) {
                    if slot.is_none() && t == text {
                        *slot = Some(vector.clone());
                    }
                }
            }
        }

        out.into_iter()
            .map(|v| {
                v.map(|v| v.as_ref().clone())
                    .ok_or_else(|| anyhow::anyhow!("embedding missing after cache fill"))
            })
            .collect()
    }
}

/// Create the configured embedder, wrapped in the cache unless disabled.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"ngram"` | [`NgramEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledEmbedder)),
        "ngram" => Arc::new(NgramEmbedder::new(config.dims.unwrap_or(DEFAULT_NGRAM_DIMS))),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Arc::new(CachedEmbedder::new(inner, config.cache_capacity)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbam_intake_core::embedding::cosine_similarity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ngram_deterministic_and_normalized() {
        let e = NgramEmbedder::new(64);
        let a = e.embed(&strings(&["crushed limestone"])).await.unwrap();
        let b = e.embed(&strings(&["crushed limestone"])).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_ngram_similarity_ordering() {
        let e = NgramEmbedder::new(256);
        let base = e.embed_one("crushed limestone");
        let near = e.embed_one("limestones, crushed");
        let far = e.embed_one("widget-42");
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
        assert!((cosine_similarity(&base, &e.embed_one("Crushed  LIMESTONE")) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_disabled_errors() {
        assert!(DisabledEmbedder.embed(&strings(&["x"])).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_dedups_and_memoizes() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(inner.clone(), 100);

        let first = cached.embed(&strings(&["a", "bb", "a"])).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0], first[2]);
        assert_eq!(inner.texts.load(Ordering::SeqCst), 2);

        let second = cached.embed(&strings(&["bb", "ccc"])).await.unwrap();
        assert_eq!(second[0], first[1]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(inner.texts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v[0], vec![1.0, 0.0]);
        assert_eq!(v[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.5]]);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_create_embedder() {
        let config = EmbeddingConfig::default();
        assert_eq!(create_embedder(&config).unwrap().model_name(), "ngram-256");

        let disabled = EmbeddingConfig {
            provider: "disabled".into(),
            ..EmbeddingConfig::default()
        };
        assert_eq!(create_embedder(&disabled).unwrap().model_name(), "disabled");
    }
}
