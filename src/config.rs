//! Configuration management for the indexing and search service

use serde::{Deserialize, Serialize};

/// Main configuration for the service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    /// Vector store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Embedding client configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// OCR engine configuration
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Indexing pipeline configuration
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Document cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Vector store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Vector dimension (must match the embedder)
    pub vector_dimension: usize,

    /// Upsert batch size into the store
    pub chunk_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:expense_rag.db".to_string(),
            vector_dimension: 384,
            chunk_batch_size: 100,
        }
    }
}

/// Embedding client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Ollama server URL
    pub ollama_url: String,

    /// Model used for embeddings
    pub model: String,

    /// Embedding dimension produced by the model
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "all-minilm".to_string(),
            dimension: 384,
            timeout: 30,
        }
    }
}

/// OCR engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Enable the remote OCR engine
    pub enabled: bool,

    /// OCR service endpoint URL
    pub endpoint: String,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:8600/ocr".to_string(),
            timeout: 60,
        }
    }
}

/// Indexing pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Size of the worker pool
    pub max_workers: usize,

    /// Maximum jobs dispatched per batch
    pub batch_size: usize,

    /// Parallel vs sequential worker mode
    pub enable_parallel_processing: bool,

    /// Whether failed jobs re-queue on demand
    pub auto_retry_failed: bool,

    /// Retry ceiling per job
    pub max_retries: usize,

    /// End-to-end processing timeout per job, in seconds
    pub processing_timeout_seconds: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            batch_size: 50,
            enable_parallel_processing: true,
            auto_retry_failed: true,
            max_retries: 3,
            processing_timeout_seconds: 300,
        }
    }
}

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default result limit
    pub default_limit: usize,

    /// Maximum result limit per request
    pub max_limit: usize,

    /// Default similarity threshold
    pub similarity_threshold_default: f32,

    /// Per-request search timeout, in seconds
    pub request_timeout_seconds: u64,

    /// Whether to deduplicate near-identical results
    pub enable_deduplication: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            similarity_threshold_default: 0.3,
            request_timeout_seconds: 10,
            enable_deduplication: true,
        }
    }
}

/// Document cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live for cache entries in seconds
    pub cache_ttl_seconds: i64,

    /// Maximum number of cache entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 3600,
            max_entries: 100,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.embedding.ollama_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid Ollama URL: {}",
                self.embedding.ollama_url
            ));
        }

        if self.embedding.model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        if self.store.vector_dimension == 0 {
            return Err(anyhow::anyhow!("Vector dimension must be greater than 0"));
        }

        if self.store.vector_dimension != self.embedding.dimension {
            return Err(anyhow::anyhow!(
                "Store vector dimension ({}) must match the embedder dimension ({})",
                self.store.vector_dimension,
                self.embedding.dimension
            ));
        }

        if self.search.similarity_threshold_default < 0.0
            || self.search.similarity_threshold_default > 1.0
        {
            return Err(anyhow::anyhow!(
                "Similarity threshold must be between 0.0 and 1.0"
            ));
        }

        if self.indexer.max_workers == 0 {
            return Err(anyhow::anyhow!("Worker pool size must be greater than 0"));
        }

        if self.indexer.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than 0"));
        }

        if self.cache.cache_ttl_seconds <= 0 {
            return Err(anyhow::anyhow!("Cache TTL must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.vector_dimension, 384);
        assert_eq!(config.indexer.processing_timeout_seconds, 300);
        assert_eq!(config.search.similarity_threshold_default, 0.3);
        assert_eq!(config.cache.cache_ttl_seconds, 3600);
    }

    #[test]
    fn test_validation_rejects_dimension_mismatch() {
        let mut config = ServiceConfig::default();
        config.store.vector_dimension = 768;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut config = ServiceConfig::default();
        config.search.similarity_threshold_default = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = ServiceConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ServiceConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.store.vector_dimension, config.store.vector_dimension);
        assert_eq!(parsed.server.port, config.server.port);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: ServiceConfig = toml::from_str("[indexer]\nmax_workers = 8\nbatch_size = 10\nenable_parallel_processing = false\nauto_retry_failed = false\nmax_retries = 1\nprocessing_timeout_seconds = 60\n").unwrap();
        assert_eq!(parsed.indexer.max_workers, 8);
        assert_eq!(parsed.store.vector_dimension, 384);
    }
}
