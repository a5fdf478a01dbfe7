//! In-process cache of completed indexing work, keyed by content hash
//!
//! The cache is an optimisation: a miss is never an error, and the whole
//! map is transient (restart starts cold).

use crate::config::CacheConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Cached outcome of a completed indexing job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDocument {
    pub job_id: String,
    pub document_id: String,
    pub chunks_created: usize,
    pub processing_time: f64,
    pub cached_at: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentCacheStats {
    pub entries: usize,
    pub ttl_seconds: i64,
}

/// TTL-bounded map of `(tenant, content_hash)` to completed job results
pub struct DocumentCache {
    entries: Mutex<HashMap<String, CachedDocument>>,
    config: CacheConfig,
}

impl DocumentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn cache_key(tenant: &str, content_hash: &str) -> String {
        format!("{}:{}", tenant, content_hash)
    }

    /// Look up a prior result; expired entries are evicted on access
    pub async fn get(&self, tenant: &str, content_hash: &str) -> Option<CachedDocument> {
        let key = Self::cache_key(tenant, content_hash);
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(&key) {
            let age = Utc::now().signed_duration_since(cached.cached_at);
            if age < Duration::seconds(self.config.cache_ttl_seconds) {
                info!("Cache hit for document hash {}", &content_hash[..8.min(content_hash.len())]);
                return Some(cached.clone());
            }
            entries.remove(&key);
            debug!("Expired cache entry removed for hash {}", &content_hash[..8.min(content_hash.len())]);
        }

        None
    }

    /// Record a completed job result
    pub async fn insert(&self, tenant: &str, content_hash: &str, value: CachedDocument) {
        let key = Self::cache_key(tenant, content_hash);
        let mut entries = self.entries.lock().await;
        entries.insert(key, value);

        // Bounded history: when over the limit, drop the ten oldest.
        if entries.len() > self.config.max_entries {
            let mut by_age: Vec<(String, DateTime<Utc>)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.cached_at))
                .collect();
            by_age.sort_by_key(|(_, cached_at)| *cached_at);

            let to_remove: Vec<String> =
                by_age.into_iter().take(10).map(|(k, _)| k).collect();
            for key in &to_remove {
                entries.remove(key);
            }
            debug!("Evicted {} old cache entries", to_remove.len());
        }
    }

    /// Remove every entry for a specific document id.
    ///
    /// Keeps the cache coherent with deletes: a hit within TTL must never
    /// point at data no longer in the store.
    pub async fn invalidate_document(&self, document_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, v| v.document_id != document_id);
    }

    /// Clear all entries
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Cache statistics
    pub async fn stats(&self) -> DocumentCacheStats {
        DocumentCacheStats {
            entries: self.entries.lock().await.len(),
            ttl_seconds: self.config.cache_ttl_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str, document_id: &str, cached_at: DateTime<Utc>) -> CachedDocument {
        CachedDocument {
            job_id: job_id.to_string(),
            document_id: document_id.to_string(),
            chunks_created: 3,
            processing_time: 1.25,
            cached_at,
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let cache = DocumentCache::new(CacheConfig::default());
        cache
            .insert("t1", "abc123def456", entry("job1", "doc1", Utc::now()))
            .await;

        let hit = cache.get("t1", "abc123def456").await.unwrap();
        assert_eq!(hit.job_id, "job1");
        assert_eq!(hit.chunks_created, 3);
    }

    #[tokio::test]
    async fn test_miss_for_other_tenant() {
        let cache = DocumentCache::new(CacheConfig::default());
        cache
            .insert("t1", "abc123def456", entry("job1", "doc1", Utc::now()))
            .await;
        assert!(cache.get("t2", "abc123def456").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_on_access() {
        let cache = DocumentCache::new(CacheConfig {
            cache_ttl_seconds: 3600,
            max_entries: 100,
        });
        let stale = Utc::now() - Duration::seconds(7200);
        cache.insert("t1", "hash", entry("job1", "doc1", stale)).await;

        assert!(cache.get("t1", "hash").await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_size_bound_evicts_oldest_ten() {
        let cache = DocumentCache::new(CacheConfig {
            cache_ttl_seconds: 3600,
            max_entries: 20,
        });

        for i in 0..21 {
            let cached_at = Utc::now() - Duration::seconds(100 - i);
            cache
                .insert("t1", &format!("hash{}", i), entry(&format!("job{}", i), "doc", cached_at))
                .await;
        }

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 11);
        // The oldest entries are gone, the newest survive
        assert!(cache.get("t1", "hash0").await.is_none());
        assert!(cache.get("t1", "hash20").await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_document() {
        let cache = DocumentCache::new(CacheConfig::default());
        cache.insert("t1", "h1", entry("job1", "doc1", Utc::now())).await;
        cache.insert("t1", "h2", entry("job2", "doc2", Utc::now())).await;

        cache.invalidate_document("doc1").await;
        assert!(cache.get("t1", "h1").await.is_none());
        assert!(cache.get("t1", "h2").await.is_some());
    }
}
