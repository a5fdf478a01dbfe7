//! Error handling for the indexing and search service

use thiserror::Error;

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Wire-level error taxonomy surfaced to callers by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid fields at the request boundary
    BadRequest,
    /// MIME type not in the parser's table
    UnsupportedType,
    /// Parser returned no text, or the chunker produced zero fragments
    EmptyContent,
    /// Object fetcher, embedder, OCR engine, or vector store failed
    UpstreamUnavailable,
    /// A processing or per-request timeout fired
    Timeout,
    /// Submission during graceful shutdown
    Shutdown,
    /// Uncategorised defect
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::UnsupportedType => "UnsupportedType",
            ErrorKind::EmptyContent => "EmptyContent",
            ErrorKind::UpstreamUnavailable => "UpstreamUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Shutdown => "Shutdown",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Main error type for the service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Processing timed out after {0} seconds")]
    Timeout(u64),

    #[error("Service is shutting down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors raised while extracting text from raw document bytes
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Document is empty")]
    EmptyContent,

    #[error("PDF extraction failed: {0}")]
    PdfExtraction(String),

    #[error("Office document extraction failed: {0}")]
    DocxExtraction(String),

    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),

    #[error("OCR failed: {0}")]
    OcrFailed(String),
}

/// Errors raised by chunking strategies
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("No fragments produced from document")]
    NoFragments,
}

/// Errors raised by the embedding client
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid embedding dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Timeout: embedding call took too long")]
    Timeout,
}

/// Errors raised by the vector store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Tenant predicate is required for this operation")]
    TenantRequired,

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),
}

/// Errors raised while fetching document bytes from an object store
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Timeout: fetch took too long")]
    Timeout,
}

impl ServiceError {
    /// Map onto the wire-level taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Parse(ParseError::UnsupportedType(_)) => ErrorKind::UnsupportedType,
            ServiceError::Parse(ParseError::EmptyContent) => ErrorKind::EmptyContent,
            ServiceError::Parse(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::Chunk(ChunkError::NoFragments) => ErrorKind::EmptyContent,
            ServiceError::Embed(EmbedError::Timeout) => ErrorKind::Timeout,
            ServiceError::Embed(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::Store(StoreError::TenantRequired) => ErrorKind::BadRequest,
            ServiceError::Store(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::Fetch(FetchError::Timeout) => ErrorKind::Timeout,
            ServiceError::Fetch(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::BadRequest(_) => ErrorKind::BadRequest,
            ServiceError::JobNotFound(_) => ErrorKind::BadRequest,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::Shutdown => ErrorKind::Shutdown,
            ServiceError::Database(_) => ErrorKind::UpstreamUnavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// Check if the error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamUnavailable | ErrorKind::Timeout
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            ServiceError::Parse(_) => "parse",
            ServiceError::Chunk(_) => "chunk",
            ServiceError::Embed(_) => "embed",
            ServiceError::Store(_) => "store",
            ServiceError::Fetch(_) => "fetch",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::JobNotFound(_) => "job_not_found",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Shutdown => "shutdown",
            ServiceError::Config(_) => "config",
            ServiceError::Io(_) => "io",
            ServiceError::Serialization(_) => "serialization",
            ServiceError::Database(_) => "database",
            ServiceError::Generic(_) => "generic",
        }
    }
}
