use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

pub const EMBEDDING_DIM: usize = 384;

/// Text embedding capability. Identical input must give identical output
/// within a run so alignment and drift scores are reproducible.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// `dot(a,b) / (|a|*|b| + 1e-10)`. Vectors of different length score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt() + 1e-10)
}

/// Local feature-hashing embedder: word unigrams and bigrams hashed into
/// signed buckets, then L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// OpenAI-compatible `/embeddings` client. Vectors of any other length
/// than `dimension` are rejected.
#[derive(Clone)]
pub struct HttpEmbedder {
    api_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimension: EMBEDDING_DIM,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

fn check_dimension(embedding: Vec<f32>, expected: usize) -> Result<Vec<f32>> {
    if embedding.len() != expected {
        anyhow::bail!(
            "Embedding has {} dimensions, expected {}",
            embedding.len(),
            expected
        );
    }
    Ok(embedding)
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.api_url);
        let mut req = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });

        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error {}: {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("Embedding response contained no vectors")?;
        check_dimension(embedding, self.dimension)
    }
}

/// Remote embeddings when an endpoint is configured, hashing otherwise.
pub fn embedder_from_config(config: &AgentConfig) -> Box<dyn Embedder> {
    match config
        .embedding_api_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        Some(url) => {
            tracing::info!("Using remote embeddings at {} ({})", url, config.embedding_model);
            Box::new(
                HttpEmbedder::new(
                    url.to_string(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.embedding_model.clone(),
                )
                .with_dimension(config.embedding_dimension),
            )
        }
        None => {
            tracing::info!("Using local hashing embeddings ({} dims)", EMBEDDING_DIM);
            Box::new(HashingEmbedder::default())
        }
    }
}
