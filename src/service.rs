//! Top-level service value owning all sub-components
//!
//! Constructed once at process startup; lifecycle (init/shutdown) is
//! scoped to this value. No module-level mutable state anywhere.

use crate::cache::DocumentCache;
use crate::chunker::ChunkRouter;
use crate::config::ServiceConfig;
use crate::embedding::{Embedder, OllamaEmbedder};
use crate::error::Result;
use crate::fetch::{HttpObjectFetcher, ObjectFetcher};
use crate::indexer::DocumentIndexer;
use crate::ocr::{HttpOcrClient, OcrEngine};
use crate::parser::DocumentParser;
use crate::query::SearchEngine;
use crate::store::FragmentStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// The assembled service: indexer, search engine, store, cache, fetcher
pub struct Service {
    pub config: ServiceConfig,
    pub store: Arc<FragmentStore>,
    pub cache: Arc<DocumentCache>,
    pub indexer: Arc<DocumentIndexer>,
    pub search: Arc<SearchEngine>,
    pub fetcher: Arc<dyn ObjectFetcher>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Builder allowing collaborator seams to be swapped (tests, alternate
/// embedding or OCR backends)
pub struct ServiceBuilder {
    config: ServiceConfig,
    embedder: Option<Arc<dyn Embedder>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    fetcher: Option<Arc<dyn ObjectFetcher>>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            embedder: None,
            ocr: None,
            fetcher: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ObjectFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub async fn build(self) -> Result<Service> {
        let config = self.config;
        config.validate().map_err(crate::error::ServiceError::Generic)?;

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(OllamaEmbedder::new(config.embedding.clone())?),
        };

        let ocr: Option<Arc<dyn OcrEngine>> = match self.ocr {
            Some(ocr) => Some(ocr),
            None if config.ocr.enabled => {
                Some(Arc::new(HttpOcrClient::new(config.ocr.clone())?))
            }
            None => None,
        };

        let fetcher: Arc<dyn ObjectFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpObjectFetcher::new(60)?),
        };

        let store = Arc::new(FragmentStore::connect(config.store.clone()).await?);
        let cache = Arc::new(DocumentCache::new(config.cache.clone()));
        let parser = Arc::new(DocumentParser::new(ocr));
        let chunker = Arc::new(ChunkRouter::new(Some(Arc::clone(&embedder))));

        let indexer = Arc::new(DocumentIndexer::new(
            parser,
            chunker,
            Arc::clone(&embedder),
            Arc::clone(&store),
            Arc::clone(&cache),
            config.indexer.clone(),
        ));

        let search = Arc::new(SearchEngine::new(
            Arc::clone(&store),
            embedder,
            config.search.clone(),
        ));

        info!("Service assembled");
        Ok(Service {
            config,
            store,
            cache,
            indexer,
            search,
            fetcher,
            dispatcher: tokio::sync::Mutex::new(None),
        })
    }
}

impl Service {
    /// Build with default collaborators
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        ServiceBuilder::new(config).build().await
    }

    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// Spawn the background worker pool
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_none() {
            let indexer = Arc::clone(&self.indexer);
            *dispatcher = Some(tokio::spawn(indexer.run()));
            info!("Worker pool started");
        }
    }

    /// Cooperative shutdown: drain in-flight jobs, then stop the dispatcher
    pub async fn shutdown(&self, grace: Duration) {
        info!("Service shutting down");
        self.indexer.shutdown(grace).await;

        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = handle.await;
        }
        info!("Service stopped");
    }

    /// Aggregate health across the search engine and the indexer
    pub async fn health(&self) -> serde_json::Value {
        let search_health = self.search.health_check().await;
        let indexer_health = self.indexer.health_check().await;

        let statuses = [&search_health["status"], &indexer_health["status"]];
        let overall = if statuses.iter().any(|s| *s == "unhealthy") {
            "unhealthy"
        } else if statuses.iter().any(|s| *s == "degraded") {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": overall,
            "timestamp": Utc::now().to_rfc3339(),
            "components": {
                "search_engine": search_health,
                "document_indexer": indexer_health,
            },
        })
    }

    /// Combined statistics, optionally scoped to one tenant
    pub async fn stats(&self, tenant: Option<&str>) -> Result<serde_json::Value> {
        let store_stats = self.store.stats(tenant).await?;
        let queue_status = self.indexer.queue_status().await;
        let cache_stats = self.cache.stats().await;

        Ok(serde_json::json!({
            "vector_store": store_stats,
            "document_indexer": queue_status,
            "document_cache": cache_stats,
        }))
    }

    /// Delete a document everywhere: fragments first, then any cache
    /// entries that still point at it.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let removed = self.store.delete_document(document_id).await?;
        self.cache.invalidate_document(document_id).await;
        Ok(removed)
    }
}
