//! REST API for the indexing and search service
//!
//! The facade performs no business logic: decode, validate, dispatch to
//! the indexer or search engine, encode.

use crate::error::{ErrorKind, Result, ServiceError};
use crate::indexer::{DocumentSource, JobStatus};
use crate::service::Service;
use crate::store::SearchFilters;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
}

/// Request to index a document by reference
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IndexRequest {
    /// Tenant owning the document
    #[schema(example = "biz_1138")]
    pub tenant: Option<String>,
    /// Caller-assigned document id
    #[schema(example = "doc_42")]
    pub document_id: Option<String>,
    /// Object-store URL to fetch the bytes from
    #[schema(example = "https://files.example.com/receipts/42.pdf")]
    pub source_url: Option<String>,
    /// Opaque caller metadata; recognised expense keys become typed columns
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Job priority, 1 (urgent) to 3
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Response for an index submission
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IndexResponse {
    pub job_id: String,
    #[schema(example = "completed")]
    pub status: String,
    pub document_id: String,
    pub tenant: String,
    pub chunks_created: usize,
    pub processing_time: f64,
    pub timestamp: String,
}

/// Request to search indexed documents
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct SearchRequest {
    #[schema(example = "starbucks coffee")]
    pub query: Option<String>,
    #[schema(example = "biz_1138")]
    pub tenant: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// "vector" (default) or "hybrid"
    #[serde(default)]
    pub search_method: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub filters: Option<SearchFilters>,
    #[serde(default)]
    pub enhance_query: Option<bool>,
}

/// Error response body
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Stats query parameters
#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub tenant: Option<String>,
}

/// Error wrapper mapping the service taxonomy onto HTTP statuses
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.0.kind().as_str().to_string(),
            missing_fields: None,
            message: Some(self.0.to_string()),
        });

        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(health_handler, stats_handler, index_handler, search_handler),
    components(schemas(IndexRequest, IndexResponse, SearchRequest, ErrorResponse)),
    tags(
        (name = "health", description = "Health and statistics"),
        (name = "index", description = "Document ingestion"),
        (name = "search", description = "Semantic search")
    ),
    info(
        title = "Expense RAG API",
        description = "Multi-tenant expense document indexing and semantic search"
    )
)]
struct ApiDoc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/index", post(index_handler))
        .route("/search", post(search_handler))
        .route("/api-docs/openapi.json", get(openapi_spec_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn openapi_spec_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "expense-rag",
        "version": crate::VERSION,
        "endpoints": {
            "GET /health": "Health check",
            "GET /stats": "System statistics",
            "POST /index": "Index a document",
            "POST /search": "Search documents",
        },
    }))
}

/// Health check aggregating the search engine and the indexer
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy or degraded"),
        (status = 503, description = "Service is unhealthy")
    )
)]
async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.service.health().await;
    let status = if health["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}

/// Queue, store, and cache statistics
#[utoipa::path(
    get,
    path = "/stats",
    tag = "health",
    params(("tenant" = Option<String>, Query, description = "Scope counts to one tenant")),
    responses((status = 200, description = "Current statistics"))
)]
async fn stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.service.stats(params.tenant.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "stats": stats,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// Fetch a document from the object store and submit it for indexing
#[utoipa::path(
    post,
    path = "/index",
    tag = "index",
    request_body = IndexRequest,
    responses(
        (status = 200, description = "Submission accepted", body = IndexResponse),
        (status = 400, description = "Missing fields", body = ErrorResponse),
        (status = 500, description = "Fetch or processing failure", body = ErrorResponse)
    )
)]
async fn index_handler(
    State(state): State<AppState>,
    Json(request): Json<IndexRequest>,
) -> Response {
    let mut missing = Vec::new();
    if request.tenant.as_deref().unwrap_or("").is_empty() {
        missing.push("tenant".to_string());
    }
    if request.document_id.as_deref().unwrap_or("").is_empty() {
        missing.push("document_id".to_string());
    }
    if request.source_url.as_deref().unwrap_or("").is_empty() {
        missing.push("source_url".to_string());
    }
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing required fields".to_string(),
                missing_fields: Some(missing),
                message: None,
            }),
        )
            .into_response();
    }

    let tenant = request.tenant.unwrap();
    let document_id = request.document_id.unwrap();
    let source_url = request.source_url.unwrap();
    let mut metadata = request.metadata;

    info!("Indexing document {} for tenant {}", document_id, tenant);

    let object = match state.service.fetcher.fetch(&source_url).await {
        Ok(object) => object,
        Err(e) => {
            error!("Fetch failed for {}: {}", source_url, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "job_id": serde_json::Value::Null,
                    "status": "failed",
                    "message": format!("Document fetch failed: {}", e),
                    "document_id": document_id,
                    "tenant": tenant,
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
                .into_response();
        }
    };

    metadata.insert("source_url".to_string(), serde_json::json!(source_url));
    metadata
        .entry("mime_type".to_string())
        .or_insert_with(|| serde_json::json!(object.mime_type));

    let filename = source_url.rsplit('/').next().map(|s| s.to_string());
    let priority = request.priority.unwrap_or(1).clamp(1, 3);

    let receipt = match state
        .service
        .indexer
        .submit(
            DocumentSource::Bytes {
                data: object.bytes,
                mime_type: object.mime_type,
                filename,
            },
            &tenant,
            Some(document_id.clone()),
            metadata,
            priority,
        )
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => return ApiError(e).into_response(),
    };

    // Give the job its full processing window before answering; if it is
    // still running, the caller polls via /stats.
    let wait = Duration::from_secs(state.service.config.indexer.processing_timeout_seconds);
    let snapshot = match receipt.status {
        JobStatus::Pending | JobStatus::Processing => state
            .service
            .indexer
            .wait_for_job(&receipt.job_id, wait)
            .await
            .unwrap_or(receipt),
        _ => receipt,
    };

    match snapshot.status {
        JobStatus::Failed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "job_id": snapshot.job_id,
                "status": "failed",
                "message": snapshot
                    .error_message
                    .unwrap_or_else(|| "processing failed".to_string()),
                "error_kind": snapshot.error_kind,
                "document_id": document_id,
                "tenant": tenant,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
        status => (
            StatusCode::OK,
            Json(IndexResponse {
                job_id: snapshot.job_id,
                status: status.as_str().to_string(),
                document_id,
                tenant,
                chunks_created: snapshot.chunks_created,
                processing_time: snapshot.processing_time.unwrap_or(0.0),
                timestamp: Utc::now().to_rfc3339(),
            }),
        )
            .into_response(),
    }
}

/// Search indexed documents for one tenant
#[utoipa::path(
    post,
    path = "/search",
    tag = "search",
    request_body = SearchRequest,
    responses(
        (status = 200, description = "Search response envelope"),
        (status = 400, description = "Missing fields", body = ErrorResponse),
        (status = 504, description = "Search timed out", body = ErrorResponse)
    )
)]
async fn search_handler(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Response {
    let mut missing = Vec::new();
    if request.query.as_deref().unwrap_or("").is_empty() {
        missing.push("query".to_string());
    }
    if request.tenant.as_deref().unwrap_or("").is_empty() {
        missing.push("tenant".to_string());
    }
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing required fields".to_string(),
                missing_fields: Some(missing),
                message: None,
            }),
        )
            .into_response();
    }

    let query = request.query.unwrap();
    let tenant = request.tenant.unwrap();
    let limit = request
        .limit
        .unwrap_or(state.service.config.search.default_limit);
    let search_method = request.search_method.unwrap_or_else(|| "auto".to_string());
    let enhance_query = request.enhance_query.unwrap_or(true);

    let deadline = Duration::from_secs(state.service.config.search.request_timeout_seconds);
    let search = state.service.search.search(
        &query,
        &tenant,
        limit,
        &search_method,
        request.filters,
        enhance_query,
    );

    match tokio::time::timeout(deadline, search).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse {
                error: "Timeout".to_string(),
                missing_fields: None,
                message: Some(format!(
                    "Search did not complete within {} seconds",
                    deadline.as_secs()
                )),
            }),
        )
            .into_response(),
    }
}

/// Bind and serve the API
pub async fn start_server(state: AppState, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    info!("Starting API server on {}", addr);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServiceError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| ServiceError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
