//! Query enhancement, retrieval, and result post-processing

use crate::config::SearchConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::{AmountFilter, AmountOp, FragmentStore, SearchFilters, SearchHit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One retrieved fragment in a search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub document_id: String,
    pub chunk_id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
    pub retrieval_method: String,
    pub tenant: String,
}

/// Complete search response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    pub processing_time_seconds: f64,
    pub search_metadata: serde_json::Value,
}

impl SearchResponse {
    fn empty(query: &str, processing_time: f64, metadata: serde_json::Value) -> Self {
        Self {
            query: query.to_string(),
            results: Vec::new(),
            total_results: 0,
            processing_time_seconds: processing_time,
            search_metadata: metadata,
        }
    }
}

/// Rewrites raw queries into a retrieval-friendlier form
pub struct QueryEnhancer {
    brand_expansions: Vec<(&'static str, &'static str)>,
    facet_synonyms: Vec<(&'static str, &'static [&'static str])>,
    patterns: Vec<(Regex, &'static str)>,
    amount_filter_re: Regex,
    date_filter_re: Regex,
    category_filter_re: Regex,
}

impl Default for QueryEnhancer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEnhancer {
    pub fn new() -> Self {
        let p = |s: &str| Regex::new(s).expect("static regex");

        Self {
            brand_expansions: vec![
                ("revolut", "revolut card payment transaction bank"),
                ("paypal", "paypal payment transaction online"),
                ("stripe", "stripe payment processing charge"),
                ("amazon", "amazon purchase order shopping"),
                ("uber", "uber ride transport taxi"),
                ("starbucks", "starbucks coffee cafe purchase"),
                ("walmart", "walmart store shopping purchase"),
                ("target", "target store shopping retail"),
            ],
            facet_synonyms: vec![
                ("amount", &["total", "cost", "price", "sum", "charge", "fee"]),
                ("vendor", &["merchant", "company", "business", "store", "supplier"]),
                ("date", &["when", "date", "time", "day", "month", "year"]),
                ("category", &["type", "category", "kind", "classification"]),
                ("payment", &["paid", "payment", "transaction", "purchase", "buy"]),
            ],
            patterns: vec![
                (p(r"\$(\d+(?:\.\d{2})?)"), "amount ${1} dollars"),
                (p(r"(\d+(?:\.\d{2})?)\s*dollars?"), "amount ${1}"),
                (p(r"(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})"), "date ${1}"),
                (p(r"how much"), "amount cost total"),
                (p(r"who paid"), "vendor merchant company"),
                (p(r"what for"), "category description purpose"),
            ],
            amount_filter_re: p(r"(?i)amount\s*([><=]+)\s*(\d+(?:\.\d{1,2})?)"),
            date_filter_re: p(r"(?i)(?:after|before|on)\s*(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})"),
            category_filter_re: p(r"(?i)category[:\s]+([^\s,]+)"),
        }
    }

    /// Enhance a query: brand expansion, pattern rewrites, then facet
    /// synonym expansion.
    pub fn enhance(&self, query: &str) -> String {
        let mut enhanced = query.to_lowercase().trim().to_string();

        // A single-word query that names a known brand expands to its
        // transactional context.
        let words: Vec<&str> = enhanced.split_whitespace().collect();
        if words.len() == 1 {
            if let Some((_, expansion)) = self
                .brand_expansions
                .iter()
                .find(|(brand, _)| *brand == words[0])
            {
                debug!("Expanded brand query '{}' -> '{}'", words[0], expansion);
                enhanced = expansion.to_string();
            }
        }

        for (pattern, replacement) in &self.patterns {
            enhanced = pattern.replace_all(&enhanced, *replacement).into_owned();
        }

        let mut expanded_words: Vec<String> = Vec::new();
        for word in enhanced.split_whitespace() {
            expanded_words.push(word.to_string());

            for (_, synonyms) in &self.facet_synonyms {
                if synonyms.contains(&word) {
                    expanded_words
                        .extend(synonyms.iter().filter(|s| **s != word).map(|s| s.to_string()));
                    break;
                }
            }
        }

        let enhanced = expanded_words.join(" ");
        debug!("Enhanced query: '{}' -> '{}'", query, enhanced);
        enhanced
    }

    /// Parse and strip inline filters from a query
    pub fn extract_filters(&self, query: &str) -> (String, SearchFilters) {
        let mut filters = SearchFilters::default();
        let mut cleaned = query.to_string();

        if let Some(caps) = self.amount_filter_re.captures(query) {
            let op = AmountOp::from_symbol(&caps[1]);
            let value: Option<f64> = caps[2].parse().ok();
            if let (Some(op), Some(value)) = (op, value) {
                filters.amount_filter = Some(AmountFilter { op, value });
                cleaned = self.amount_filter_re.replace_all(&cleaned, "").into_owned();
            }
        }

        if let Some(caps) = self.date_filter_re.captures(query) {
            filters
                .extra
                .insert("date_filter".to_string(), serde_json::json!(&caps[1]));
            cleaned = self.date_filter_re.replace_all(&cleaned, "").into_owned();
        }

        if let Some(caps) = self.category_filter_re.captures(query) {
            filters.category = Some(caps[1].to_string());
            cleaned = self.category_filter_re.replace_all(&cleaned, "").into_owned();
        }

        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        (cleaned, filters)
    }
}

/// Highlights, deduplicates, and orders raw search hits
pub struct ResultPostProcessor {
    highlight_patterns: Vec<Regex>,
}

impl Default for ResultPostProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultPostProcessor {
    pub fn new() -> Self {
        let p = |s: &str| Regex::new(s).expect("static regex");
        Self {
            highlight_patterns: vec![
                p(r"\$\d+(?:\.\d{2})?"),
                p(r"\d{1,2}[/-]\d{1,2}[/-]\d{2,4}"),
                p(r"(?i)\b(total|amount|sum|cost|price)\b"),
                p(r"(?i)\b(invoice|receipt|bill|statement)\b"),
            ],
        }
    }

    /// Convert hits into results with highlighted content, sorted by score
    pub fn process(&self, hits: &[SearchHit], query: &str, max_results: usize) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = hits
            .iter()
            .take(max_results)
            .map(|hit| {
                let metadata: serde_json::Value =
                    serde_json::from_str(&hit.fragment.metadata_json)
                        .unwrap_or_else(|_| serde_json::json!({}));

                SearchResult {
                    content: self.highlight(&hit.fragment.content, query),
                    document_id: hit.fragment.document_id.clone(),
                    chunk_id: hit.fragment.fragment_id.clone(),
                    score: hit.hybrid_score.unwrap_or(hit.similarity),
                    metadata,
                    retrieval_method: if hit.hybrid_score.is_some() {
                        "hybrid".to_string()
                    } else {
                        "vector".to_string()
                    },
                    tenant: hit.fragment.tenant.clone(),
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results
    }

    /// Wrap query terms and money/date patterns in `**...**`
    fn highlight(&self, content: &str, query: &str) -> String {
        let mut highlighted = content.to_string();

        for term in query.to_lowercase().split_whitespace() {
            if term.len() > 2 {
                if let Ok(re) = Regex::new(&format!(r"(?i){}", regex::escape(term))) {
                    highlighted = re.replace_all(&highlighted, "**${0}**").into_owned();
                }
            }
        }

        for pattern in &self.highlight_patterns {
            highlighted = pattern.replace_all(&highlighted, "**${0}**").into_owned();
        }

        highlighted
    }

    /// Remove results whose contents are equal after normalisation, or
    /// whose token sets overlap almost entirely.
    pub fn deduplicate(&self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        let mut deduplicated = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for result in results {
            let normalized = result
                .content
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");

            if seen.contains(&normalized) {
                continue;
            }

            let is_near_duplicate = seen
                .iter()
                .any(|prior| jaccard_similarity(prior, &normalized) > 0.9);
            if is_near_duplicate {
                continue;
            }

            seen.push(normalized);
            deduplicated.push(result);
        }

        deduplicated
    }
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Orchestrates query enhancement, vector retrieval, and post-processing.
///
/// Holds a non-owning handle to the vector store; never a reference back
/// to the indexer.
pub struct SearchEngine {
    store: Arc<FragmentStore>,
    embedder: Arc<dyn Embedder>,
    enhancer: Option<QueryEnhancer>,
    post_processor: Option<ResultPostProcessor>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        store: Arc<FragmentStore>,
        embedder: Arc<dyn Embedder>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            enhancer: Some(QueryEnhancer::new()),
            post_processor: Some(ResultPostProcessor::new()),
            config,
        }
    }

    /// Disable query enhancement and post-processing (mostly for tests)
    pub fn without_enhancement(mut self) -> Self {
        self.enhancer = None;
        self.post_processor = None;
        self
    }

    /// Search indexed fragments for one tenant.
    ///
    /// Failures never partially succeed: the response carries an empty
    /// result list and the error in its metadata.
    pub async fn search(
        &self,
        query: &str,
        tenant: &str,
        limit: usize,
        search_method: &str,
        filters: Option<SearchFilters>,
        enhance_query: bool,
    ) -> SearchResponse {
        let start = Instant::now();
        info!("Searching '{}' for tenant {}", query, tenant);

        if query.trim().is_empty() {
            return SearchResponse::empty(
                query,
                start.elapsed().as_secs_f64(),
                serde_json::json!({"error": "Empty query"}),
            );
        }

        let limit = limit.min(self.config.max_limit);
        if limit == 0 {
            return SearchResponse::empty(
                query,
                start.elapsed().as_secs_f64(),
                serde_json::json!({"total_raw_results": 0}),
            );
        }

        let mut enhanced_query = query.to_string();
        let mut effective_filters = filters.unwrap_or_default();

        if enhance_query {
            if let Some(enhancer) = &self.enhancer {
                enhanced_query = enhancer.enhance(query);
                let (cleaned, extracted) = enhancer.extract_filters(&enhanced_query);
                enhanced_query = cleaned;

                if effective_filters.amount_filter.is_none() {
                    effective_filters.amount_filter = extracted.amount_filter;
                }
                if effective_filters.category.is_none() {
                    effective_filters.category = extracted.category;
                }
                effective_filters.extra.extend(extracted.extra);
            }
        }

        let outcome = self
            .retrieve(&enhanced_query, tenant, limit, search_method, &effective_filters)
            .await;

        let raw_hits = match outcome {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Search failed: {}", e);
                return SearchResponse::empty(
                    query,
                    start.elapsed().as_secs_f64(),
                    serde_json::json!({
                        "error": e.to_string(),
                        "error_kind": e.kind().as_str(),
                    }),
                );
            }
        };

        let total_raw = raw_hits.len();

        let results = match &self.post_processor {
            Some(processor) => {
                let processed = processor.process(&raw_hits, query, limit * 2);
                let deduplicated = if self.config.enable_deduplication {
                    processor.deduplicate(processed)
                } else {
                    processed
                };
                deduplicated.into_iter().take(limit).collect()
            }
            None => raw_hits
                .iter()
                .take(limit)
                .map(|hit| SearchResult {
                    content: hit.fragment.content.clone(),
                    document_id: hit.fragment.document_id.clone(),
                    chunk_id: hit.fragment.fragment_id.clone(),
                    score: hit.hybrid_score.unwrap_or(hit.similarity),
                    metadata: serde_json::from_str(&hit.fragment.metadata_json)
                        .unwrap_or_else(|_| serde_json::json!({})),
                    retrieval_method: "vector".to_string(),
                    tenant: hit.fragment.tenant.clone(),
                })
                .collect::<Vec<_>>(),
        };

        let processing_time = start.elapsed().as_secs_f64();
        let metadata = serde_json::json!({
            "original_query": query,
            "enhanced_query": if enhance_query { Some(enhanced_query.as_str()) } else { None },
            "search_method": search_method,
            "filters_applied": effective_filters,
            "total_raw_results": total_raw,
            "post_processing_enabled": self.post_processor.is_some(),
            "deduplication_enabled": self.config.enable_deduplication,
        });

        info!(
            "Search completed: {} results in {:.3}s",
            results.len(),
            processing_time
        );

        SearchResponse {
            query: query.to_string(),
            total_results: results.len(),
            results,
            processing_time_seconds: processing_time,
            search_metadata: metadata,
        }
    }

    async fn retrieve(
        &self,
        enhanced_query: &str,
        tenant: &str,
        limit: usize,
        search_method: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let query_vector = self.embedder.embed(enhanced_query).await?;

        match search_method {
            "hybrid" => {
                self.store
                    .hybrid_search(enhanced_query, &query_vector, tenant, limit, filters)
                    .await
            }
            _ => {
                // Double the candidate set for post-processing headroom.
                self.store
                    .search(
                        &query_vector,
                        tenant,
                        limit * 2,
                        filters,
                        self.config.similarity_threshold_default,
                    )
                    .await
            }
        }
    }

    /// All fragments of a document, in chunk order
    pub async fn document_chunks(
        &self,
        document_id: &str,
    ) -> Result<Vec<crate::store::StoredFragment>> {
        self.store.get_by_document(document_id).await
    }

    /// Delete a document and its fragments
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        self.store.delete_document(document_id).await
    }

    /// Health check: store health plus a probe search
    pub async fn health_check(&self) -> serde_json::Value {
        let store_health = self.store.health_check().await;

        let probe = self
            .search("test search", "health_check_tenant", 1, "vector", None, false)
            .await;
        let probe_ok = probe.search_metadata.get("error").is_none();

        let status = if store_health["status"] != "healthy" || !probe_ok {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "vector_store": store_health,
            "search_probe": {
                "ok": probe_ok,
                "processing_time": probe.processing_time_seconds,
            },
            "capabilities": {
                "query_enhancement": self.enhancer.is_some(),
                "result_postprocessing": self.post_processor.is_some(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_expansion_single_word_only() {
        let enhancer = QueryEnhancer::new();
        let expanded = enhancer.enhance("starbucks");
        assert!(expanded.contains("coffee"));

        let untouched = enhancer.enhance("starbucks receipt yesterday");
        assert!(untouched.contains("starbucks"));
        assert!(!untouched.contains("cafe purchase"));
    }

    #[test]
    fn test_pattern_rewrites() {
        let enhancer = QueryEnhancer::new();

        let rewritten = enhancer.enhance("spent $50.00 there");
        assert!(rewritten.contains("amount 50.00 dollars"));

        let rewritten = enhancer.enhance("how much did I spend");
        assert!(rewritten.contains("amount cost total"));

        let rewritten = enhancer.enhance("receipts from 12/25/2023");
        assert!(rewritten.contains("date 12/25/2023"));
    }

    #[test]
    fn test_synonym_expansion() {
        let enhancer = QueryEnhancer::new();
        let expanded = enhancer.enhance("total paid");
        // "total" is an amount synonym, so its siblings get appended
        assert!(expanded.contains("cost"));
        assert!(expanded.contains("charge"));
        // "paid" is a payment synonym
        assert!(expanded.contains("transaction"));
    }

    #[test]
    fn test_extract_amount_filter() {
        let enhancer = QueryEnhancer::new();
        let (cleaned, filters) = enhancer.extract_filters("coffee amount > 50");

        let amount = filters.amount_filter.unwrap();
        assert_eq!(amount.op, AmountOp::Gt);
        assert_eq!(amount.value, 50.0);
        assert!(!cleaned.contains('>'));
        assert!(cleaned.contains("coffee"));
    }

    #[test]
    fn test_extract_category_and_date_filters() {
        let enhancer = QueryEnhancer::new();

        let (cleaned, filters) = enhancer.extract_filters("lunch category: meals");
        assert_eq!(filters.category.as_deref(), Some("meals"));
        assert_eq!(cleaned, "lunch");

        let (cleaned, filters) = enhancer.extract_filters("purchases after 01/01/2024");
        assert_eq!(
            filters.extra.get("date_filter"),
            Some(&serde_json::json!("01/01/2024"))
        );
        assert_eq!(cleaned, "purchases");
    }

    #[test]
    fn test_s4_scenario_enhance_then_extract() {
        let enhancer = QueryEnhancer::new();
        let enhanced = enhancer.enhance("how much did I spend at amazon amount > 50");
        assert!(enhanced.contains("amount cost total"));

        let (cleaned, filters) = enhancer.extract_filters(&enhanced);
        let amount = filters.amount_filter.unwrap();
        assert_eq!(amount.op, AmountOp::Gt);
        assert_eq!(amount.value, 50.0);
        assert!(cleaned.contains("amazon"));
    }

    #[test]
    fn test_highlighting() {
        let processor = ResultPostProcessor::new();
        let highlighted = processor.highlight("Starbucks latte total $4.50", "starbucks latte");
        assert!(highlighted.contains("**Starbucks**"));
        assert!(highlighted.contains("**latte**"));
        assert!(highlighted.contains("**$4.50**"));
    }

    #[test]
    fn test_short_terms_not_highlighted() {
        let processor = ResultPostProcessor::new();
        let highlighted = processor.highlight("an apple a day", "an a");
        assert!(!highlighted.contains("**an**"));
    }

    fn result(content: &str, score: f32) -> SearchResult {
        SearchResult {
            content: content.to_string(),
            document_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
            score,
            metadata: serde_json::json!({}),
            retrieval_method: "vector".to_string(),
            tenant: "t1".to_string(),
        }
    }

    #[test]
    fn test_deduplication_exact_and_near() {
        let processor = ResultPostProcessor::new();

        let results = vec![
            result("the quick brown fox jumps over the lazy dog near here", 0.9),
            result("The quick  brown fox jumps over the lazy dog near here", 0.8),
            result("completely different content entirely", 0.7),
        ];

        let deduplicated = processor.deduplicate(results);
        assert_eq!(deduplicated.len(), 2);
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard_similarity("a b c", "a b c"), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        assert!(jaccard_similarity("a b c d", "a b c e") > 0.5);
    }
}
