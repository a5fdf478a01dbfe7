//! Tenant-scoped vector store for document fragments
//!
//! SQLite-backed: vectors live in a fixed-width BLOB column and similarity
//! is computed by brute-force scan over the SQL-prefiltered candidate set.

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// A fragment row to persist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentRow {
    pub fragment_id: String,
    pub tenant: String,
    pub document_id: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub chunk_index: usize,
    pub chunk_type: String,
    pub parent_fragment_id: Option<String>,
    pub start_char: usize,
    pub end_char: usize,
    pub amount: f64,
    pub category: String,
    pub merchant: String,
    pub expense_date: String,
    pub document_type: String,
    pub source_url: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted fragment read back from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFragment {
    pub fragment_id: String,
    pub tenant: String,
    pub document_id: String,
    pub content: String,
    pub vector: Vec<f32>,
    pub chunk_index: usize,
    pub chunk_type: String,
    pub parent_fragment_id: Option<String>,
    pub start_char: usize,
    pub end_char: usize,
    pub amount: f64,
    pub category: String,
    pub merchant: String,
    pub expense_date: String,
    pub document_type: String,
    pub source_url: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
}

/// Comparison operator for amount filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl AmountOp {
    fn as_sql(&self) -> &'static str {
        match self {
            AmountOp::Eq => "=",
            AmountOp::Lt => "<",
            AmountOp::Le => "<=",
            AmountOp::Gt => ">",
            AmountOp::Ge => ">=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "=" | "==" => Some(AmountOp::Eq),
            "<" => Some(AmountOp::Lt),
            "<=" => Some(AmountOp::Le),
            ">" => Some(AmountOp::Gt),
            ">=" => Some(AmountOp::Ge),
            _ => None,
        }
    }
}

/// Numeric predicate over the fragment amount column
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AmountFilter {
    pub op: AmountOp,
    pub value: f64,
}

/// Typed search filters; anything unrecognised falls back to a JSON
/// substring predicate over the metadata column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_filter: Option<AmountFilter>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.merchant.is_none()
            && self.document_type.is_none()
            && self.amount_filter.is_none()
            && self.extra.is_empty()
    }
}

/// A search hit with its similarity score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub fragment: StoredFragment,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,
}

/// Store-level statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_chunks: u64,
    pub unique_documents: u64,
    pub unique_businesses: u64,
}

/// SQLite-backed fragment store
pub struct FragmentStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl FragmentStore {
    /// Connect to the store and create the schema if missing
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        info!("Initializing fragment store at {}", config.database_url);

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| StoreError::StorageFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fragments (
                fragment_id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                document_id TEXT NOT NULL,
                content TEXT NOT NULL,
                vector BLOB NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_type TEXT NOT NULL,
                parent_fragment_id TEXT,
                start_char INTEGER NOT NULL,
                end_char INTEGER NOT NULL,
                amount REAL NOT NULL DEFAULT 0,
                category TEXT NOT NULL DEFAULT '',
                merchant TEXT NOT NULL DEFAULT '',
                expense_date TEXT NOT NULL DEFAULT '',
                document_type TEXT NOT NULL DEFAULT '',
                source_url TEXT NOT NULL DEFAULT '',
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_tenant ON fragments(tenant)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_fragments_document ON fragments(document_id)",
        )
        .execute(&pool)
        .await?;

        info!("Fragment store initialized");
        Ok(Self { pool, config })
    }

    /// Configured vector dimension
    pub fn dimension(&self) -> usize {
        self.config.vector_dimension
    }

    /// Serialize a vector for storage
    pub fn serialize_vector(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize a vector from storage
    pub fn deserialize_vector(data: &[u8]) -> Vec<f32> {
        data.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Insert fragment rows, batched.
    ///
    /// Rows with empty content are dropped with a warning. A failed batch
    /// fails the whole call; fragment ids are stable so a retry with the
    /// same rows is idempotent per row.
    pub async fn upsert(&self, rows: Vec<FragmentRow>) -> Result<Vec<String>> {
        let mut accepted = Vec::new();
        let mut to_insert = Vec::new();

        for row in rows {
            if row.content.trim().is_empty() {
                warn!("Skipping fragment with empty content: {}", row.fragment_id);
                continue;
            }
            if row.vector.len() != self.config.vector_dimension {
                return Err(StoreError::InvalidDimension {
                    expected: self.config.vector_dimension,
                    actual: row.vector.len(),
                }
                .into());
            }
            if row.tenant.is_empty() {
                return Err(StoreError::TenantRequired.into());
            }
            to_insert.push(row);
        }

        for batch in to_insert.chunks(self.config.chunk_batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;

            for row in batch {
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO fragments (
                        fragment_id, tenant, document_id, content, vector,
                        chunk_index, chunk_type, parent_fragment_id, start_char, end_char,
                        amount, category, merchant, expense_date, document_type,
                        source_url, metadata_json, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                    "#,
                )
                .bind(&row.fragment_id)
                .bind(&row.tenant)
                .bind(&row.document_id)
                .bind(&row.content)
                .bind(Self::serialize_vector(&row.vector))
                .bind(row.chunk_index as i64)
                .bind(&row.chunk_type)
                .bind(&row.parent_fragment_id)
                .bind(row.start_char as i64)
                .bind(row.end_char as i64)
                .bind(row.amount)
                .bind(&row.category)
                .bind(&row.merchant)
                .bind(&row.expense_date)
                .bind(&row.document_type)
                .bind(&row.source_url)
                .bind(&row.metadata_json)
                .bind(row.created_at.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            accepted.extend(batch.iter().map(|r| r.fragment_id.clone()));
        }

        info!("Upserted {} fragments", accepted.len());
        Ok(accepted)
    }

    /// Top-k nearest-neighbour search under a mandatory tenant predicate.
    ///
    /// Similarity is `max(0, 1 - cosine_distance / 2)`; results below
    /// `threshold` are dropped and the rest sorted descending.
    pub async fn search(
        &self,
        query_vector: &[f32],
        tenant: &str,
        limit: usize,
        filters: &SearchFilters,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        if tenant.is_empty() {
            return Err(StoreError::TenantRequired.into());
        }

        if query_vector.len() != self.config.vector_dimension {
            return Err(StoreError::InvalidDimension {
                expected: self.config.vector_dimension,
                actual: query_vector.len(),
            }
            .into());
        }

        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from("SELECT * FROM fragments WHERE tenant = ?1");
        let mut string_binds: Vec<String> = Vec::new();

        if let Some(category) = &filters.category {
            string_binds.push(category.clone());
            sql.push_str(&format!(" AND category = ?{}", string_binds.len() + 1));
        }
        if let Some(merchant) = &filters.merchant {
            string_binds.push(format!("%{}%", merchant));
            sql.push_str(&format!(" AND merchant LIKE ?{}", string_binds.len() + 1));
        }
        if let Some(document_type) = &filters.document_type {
            string_binds.push(document_type.clone());
            sql.push_str(&format!(" AND document_type = ?{}", string_binds.len() + 1));
        }
        if let Some(amount) = &filters.amount_filter {
            // Operator comes from a closed enum, never from caller text.
            sql.push_str(&format!(" AND amount {} {}", amount.op.as_sql(), amount.value));
        }
        for (key, value) in &filters.extra {
            let needle = match value {
                serde_json::Value::String(s) => format!("%\"{}\":\"{}\"%", key, s),
                other => format!("%\"{}\":{}%", key, other),
            };
            string_binds.push(needle);
            sql.push_str(&format!(" AND metadata_json LIKE ?{}", string_binds.len() + 1));
        }

        let mut query = sqlx::query(&sql).bind(tenant);
        for bind in &string_binds {
            query = query.bind(bind);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::SearchFailed(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let fragment = Self::fragment_from_row(&row)?;
            let cosine = crate::embedding::cosine_similarity(query_vector, &fragment.vector);
            let distance = 1.0 - cosine;
            let similarity = (1.0 - distance / 2.0).max(0.0);

            if similarity >= threshold {
                hits.push(SearchHit {
                    fragment,
                    similarity,
                    hybrid_score: None,
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        debug!(
            "Search for tenant {} returned {} hits above {}",
            tenant,
            hits.len(),
            threshold
        );
        Ok(hits)
    }

    /// Vector search with a keyword-overlap boost.
    ///
    /// Transitional implementation until the backend grows a lexical index:
    /// the candidate set is doubled at threshold 0.5 and re-ranked with
    /// `0.7 * similarity + 0.3 * keyword_overlap`.
    pub async fn hybrid_search(
        &self,
        query_text: &str,
        query_vector: &[f32],
        tenant: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self
            .search(query_vector, tenant, limit * 2, filters, 0.5)
            .await?;

        let query_terms: Vec<String> = query_text
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        for hit in &mut hits {
            let content_lower = hit.fragment.content.to_lowercase();
            let matches = query_terms
                .iter()
                .filter(|term| content_lower.contains(term.as_str()))
                .count();
            let keyword_score = if query_terms.is_empty() {
                0.0
            } else {
                matches as f32 / query_terms.len() as f32
            };
            hit.hybrid_score = Some(hit.similarity * 0.7 + keyword_score * 0.3);
        }

        hits.sort_by(|a, b| {
            b.hybrid_score
                .partial_cmp(&a.hybrid_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// All fragments of a document, ordered by chunk index
    pub async fn get_by_document(&self, document_id: &str) -> Result<Vec<StoredFragment>> {
        let rows = sqlx::query(
            "SELECT * FROM fragments WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::fragment_from_row).collect()
    }

    /// Delete all fragments of a document; returns the number removed
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fragments WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        info!(
            "Deleted {} fragments for document {}",
            result.rows_affected(),
            document_id
        );
        Ok(result.rows_affected())
    }

    /// Fragment count for one tenant
    pub async fn count_for_tenant(&self, tenant: &str) -> Result<u64> {
        if tenant.is_empty() {
            return Err(StoreError::TenantRequired.into());
        }

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fragments WHERE tenant = ?1")
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Store statistics, optionally scoped to one tenant
    pub async fn stats(&self, tenant: Option<&str>) -> Result<StoreStats> {
        let (sql, bind) = match tenant {
            Some(t) => (
                "SELECT COUNT(*), COUNT(DISTINCT document_id), COUNT(DISTINCT tenant) \
                 FROM fragments WHERE tenant = ?1",
                Some(t),
            ),
            None => (
                "SELECT COUNT(*), COUNT(DISTINCT document_id), COUNT(DISTINCT tenant) \
                 FROM fragments",
                None,
            ),
        };

        let mut query = sqlx::query_as::<_, (i64, i64, i64)>(sql);
        if let Some(t) = bind {
            query = query.bind(t);
        }
        let (total, documents, businesses) = query.fetch_one(&self.pool).await?;

        Ok(StoreStats {
            total_chunks: total as u64,
            unique_documents: documents as u64,
            unique_businesses: businesses as u64,
        })
    }

    /// Health check on the store
    pub async fn health_check(&self) -> serde_json::Value {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => serde_json::json!({
                "status": "healthy",
                "vector_dimension": self.config.vector_dimension,
            }),
            Err(e) => serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        }
    }

    fn fragment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredFragment> {
        let vector_blob: Vec<u8> = row.get("vector");
        let created_at: String = row.get("created_at");
        let chunk_index: i64 = row.get("chunk_index");
        let start_char: i64 = row.get("start_char");
        let end_char: i64 = row.get("end_char");

        Ok(StoredFragment {
            fragment_id: row.get("fragment_id"),
            tenant: row.get("tenant"),
            document_id: row.get("document_id"),
            content: row.get("content"),
            vector: Self::deserialize_vector(&vector_blob),
            chunk_index: chunk_index as usize,
            chunk_type: row.get("chunk_type"),
            parent_fragment_id: row.get("parent_fragment_id"),
            start_char: start_char as usize,
            end_char: end_char as usize,
            amount: row.get("amount"),
            category: row.get("category"),
            merchant: row.get("merchant"),
            expense_date: row.get("expense_date"),
            document_type: row.get("document_type"),
            source_url: row.get("source_url"),
            metadata_json: row.get("metadata_json"),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::StorageFailed(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}
