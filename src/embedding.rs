//! Embedding client for mapping text to dense vectors

use crate::config::EmbeddingConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

/// Trait for text-to-vector embedding operations.
///
/// Implementations must be pure per input text, thread-safe, and produce
/// vectors of a fixed dimension for the life of the instance.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for a batch of texts, in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed output dimension
    fn dimension(&self) -> usize;
}

/// Ollama-backed embedding client
pub struct OllamaEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

/// Ollama API request for embeddings
#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

/// Ollama API response for embeddings
#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    /// Create a new Ollama embedding client
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| EmbedError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/api/embeddings",
            self.config.ollama_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbedRequest {
            model: self.config.model.clone(),
            prompt: text.to_string(),
        };

        let url = self.api_url();
        debug!("Embedding {} chars via {}", text.len(), url);

        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client.post(&url).json(&request).send(),
        )
        .await
        .map_err(|_| EmbedError::Timeout)?
        .map_err(|e| EmbedError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Embedding API error: {}", error_text);
            return Err(EmbedError::EmbeddingFailed(error_text).into());
        }

        let ollama_response: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;

        if ollama_response.embedding.len() != self.config.dimension {
            return Err(EmbedError::InvalidDimension {
                expected: self.config.dimension,
                actual: ollama_response.embedding.len(),
            }
            .into());
        }

        Ok(ollama_response.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Ollama's embeddings endpoint is single-prompt; batch sequentially
        // to keep request ordering deterministic.
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Mean of a set of vectors, element-wise
pub fn mean_vector(vectors: &[Vec<f32>]) -> Vec<f32> {
    if vectors.is_empty() {
        return Vec::new();
    }

    let dim = vectors[0].len();
    let mut mean = vec![0.0f32; dim];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    mean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(cosine_similarity(&a, &b), 1.0);
        assert_eq!(cosine_similarity(&a, &c), 0.0);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_mean_vector() {
        let vectors = vec![vec![1.0, 0.0], vec![3.0, 2.0]];
        assert_eq!(mean_vector(&vectors), vec![2.0, 1.0]);
        assert!(mean_vector(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_embed_via_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": vec![0.5f32; 4]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            ollama_url: server.uri(),
            model: "all-minilm".to_string(),
            dimension: 4,
            timeout: 5,
        };

        let embedder = OllamaEmbedder::new(config).unwrap();
        let vector = embedder.embed("latte at starbucks").await.unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(embedder.dimension(), 4);
    }

    #[tokio::test]
    async fn test_embed_dimension_mismatch_is_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": vec![0.5f32; 8]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            ollama_url: server.uri(),
            model: "all-minilm".to_string(),
            dimension: 4,
            timeout: 5,
        };

        let embedder = OllamaEmbedder::new(config).unwrap();
        assert!(embedder.embed("text").await.is_err());
    }
}
