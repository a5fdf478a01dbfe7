//! Expense document indexing and semantic search
//!
//! A multi-tenant service that ingests expense-related documents
//! (receipts, invoices, statements), splits them into typed fragments,
//! embeds them, and answers natural-language queries scoped strictly to
//! the submitting tenant.
//!
//! # Example
//!
//! ```rust,no_run
//! use expense_rag::{Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::default();
//!     let service = Service::new(config).await?;
//!     service.start().await;
//!
//!     let response = service
//!         .search
//!         .search("starbucks coffee", "biz_1138", 10, "vector", None, true)
//!         .await;
//!     println!("{} results", response.total_results);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod indexer;
pub mod ocr;
pub mod parser;
pub mod query;
pub mod service;
pub mod store;

// Re-export main types
pub use cache::{CachedDocument, DocumentCache};
pub use chunker::{Chunk, ChunkMetadata, ChunkRouter, ChunkType};
pub use config::{
    CacheConfig, EmbeddingConfig, IndexerConfig, OcrConfig, SearchConfig, ServerConfig,
    ServiceConfig, StoreConfig,
};
pub use document::{classify_document, DocumentClass};
pub use embedding::{cosine_similarity, Embedder, OllamaEmbedder};
pub use error::{ErrorKind, Result, ServiceError};
pub use fetch::{FetchedObject, HttpObjectFetcher, ObjectFetcher};
pub use indexer::{
    DocumentIndexer, DocumentSource, IndexerMetrics, JobSnapshot, JobStatus, QueueStatus,
};
pub use ocr::{HttpOcrClient, OcrEngine, OcrResult};
pub use parser::{DocumentParser, ParsedDocument};
pub use query::{QueryEnhancer, ResultPostProcessor, SearchEngine, SearchResponse, SearchResult};
pub use service::{Service, ServiceBuilder};
pub use store::{
    AmountFilter, AmountOp, FragmentRow, FragmentStore, SearchFilters, SearchHit, StoreStats,
    StoredFragment,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
