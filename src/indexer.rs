//! End-to-end document indexing pipeline
//!
//! Job intake, priority queue, worker pool, per-stage progress tracking,
//! retry with backoff, metrics, and the content-hash cache that suppresses
//! redundant work.

use crate::cache::{CachedDocument, DocumentCache};
use crate::chunker::ChunkRouter;
use crate::config::IndexerConfig;
use crate::embedding::Embedder;
use crate::error::{ChunkError, ErrorKind, ParseError, Result, ServiceError};
use crate::parser::{mime_from_extension, DocumentParser};
use crate::store::{FragmentRow, FragmentStore};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A pipeline stage recorded on completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedStage {
    pub stage: String,
    pub completed_at: DateTime<Utc>,
}

/// Per-job progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: Option<String>,
    pub percentage: u8,
    pub stages_completed: Vec<CompletedStage>,
}

impl JobProgress {
    fn update(&mut self, stage: &str, percentage: u8) {
        if self.stage.as_deref() != Some(stage) {
            if let Some(previous) = self.stage.take() {
                self.stages_completed.push(CompletedStage {
                    stage: previous,
                    completed_at: Utc::now(),
                });
            }
            self.stage = Some(stage.to_string());
        }
        self.percentage = percentage;
    }
}

/// Where a job's bytes come from
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Bytes {
        data: Vec<u8>,
        mime_type: String,
        filename: Option<String>,
    },
    File {
        path: PathBuf,
    },
}

/// One unit of ingestion work, tracked end-to-end
#[derive(Debug)]
pub struct IndexingJob {
    pub job_id: String,
    pub tenant: String,
    pub document_id: String,
    pub source: DocumentSource,
    pub metadata: HashMap<String, serde_json::Value>,
    pub priority: u8,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub chunks_created: usize,
    pub processing_time: Option<f64>,
    pub progress: JobProgress,
    pub retry_count: usize,
    pub content_hash: String,
    pub from_cache: bool,
}

/// Serializable view of a job for status queries and the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub tenant: String,
    pub document_id: String,
    pub priority: u8,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub chunks_created: usize,
    pub processing_time: Option<f64>,
    pub progress: JobProgress,
    pub retry_count: usize,
    pub from_cache: bool,
}

impl IndexingJob {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            tenant: self.tenant.clone(),
            document_id: self.document_id.clone(),
            priority: self.priority,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            error_kind: self.error_kind.map(|k| k.as_str().to_string()),
            chunks_created: self.chunks_created,
            processing_time: self.processing_time,
            progress: self.progress.clone(),
            retry_count: self.retry_count,
            from_cache: self.from_cache,
        }
    }
}

/// Aggregate pipeline metrics, updated on every terminal transition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerMetrics {
    pub total_jobs: u64,
    pub total_documents: u64,
    pub total_fragments: u64,
    pub total_processing_time: f64,
    pub average_processing_time: f64,
    pub success_rate: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Snapshot of the queue state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending_jobs: usize,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_jobs: usize,
    pub metrics: IndexerMetrics,
}

type SharedJob = Arc<Mutex<IndexingJob>>;

/// Queue entry carrying the priority outside the job lock so ordering
/// never has to take it
struct QueueEntry {
    priority: u8,
    job: SharedJob,
}

/// End-to-end document indexing pipeline
pub struct DocumentIndexer {
    parser: Arc<DocumentParser>,
    chunker: Arc<ChunkRouter>,
    embedder: Arc<dyn Embedder>,
    store: Arc<FragmentStore>,
    cache: Arc<DocumentCache>,
    config: IndexerConfig,
    queue: Mutex<Vec<QueueEntry>>,
    active: Mutex<HashMap<String, SharedJob>>,
    completed: Mutex<HashMap<String, SharedJob>>,
    failed: Mutex<HashMap<String, SharedJob>>,
    metrics: Mutex<IndexerMetrics>,
    shutting_down: AtomicBool,
    work_available: Notify,
    job_done: Notify,
}

impl DocumentIndexer {
    pub fn new(
        parser: Arc<DocumentParser>,
        chunker: Arc<ChunkRouter>,
        embedder: Arc<dyn Embedder>,
        store: Arc<FragmentStore>,
        cache: Arc<DocumentCache>,
        config: IndexerConfig,
    ) -> Self {
        info!(
            "Initialized document indexer ({} workers, batch {})",
            config.max_workers, config.batch_size
        );

        Self {
            parser,
            chunker,
            embedder,
            store,
            cache,
            config,
            queue: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            metrics: Mutex::new(IndexerMetrics::default()),
            shutting_down: AtomicBool::new(false),
            work_available: Notify::new(),
            job_done: Notify::new(),
        }
    }

    /// SHA-256 over the raw document bytes, hex encoded
    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn generate_job_id() -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        format!("job_{}_{}", stamp, &suffix[..8])
    }

    /// Stable document id derived from the source reference, tenant, and
    /// ingest time. Re-ingesting the same document yields a fresh id.
    fn derive_document_id(source_ref: &str, tenant: &str, created_at: DateTime<Utc>) -> String {
        let seed = format!("{}_{}_{}", source_ref, tenant, created_at.to_rfc3339());
        format!("{:x}", md5::compute(seed.as_bytes()))
    }

    /// Submit a document for indexing.
    ///
    /// Returns the job id. A cache hit synthesises a completed job without
    /// enqueueing; an unsupported MIME type synthesises a failed job that is
    /// never retried.
    pub async fn submit(
        &self,
        source: DocumentSource,
        tenant: &str,
        document_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        priority: u8,
    ) -> Result<JobSnapshot> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::Shutdown);
        }

        if tenant.is_empty() {
            return Err(ServiceError::BadRequest("tenant must not be empty".to_string()));
        }

        // Resolve the source into bytes + mime so the hash and validation
        // happen at the submission boundary.
        let (data, mime_type, filename, source_ref) = match source {
            DocumentSource::Bytes {
                data,
                mime_type,
                filename,
            } => {
                let source_ref = filename.clone().unwrap_or_else(|| "inline".to_string());
                (data, mime_type, filename, source_ref)
            }
            DocumentSource::File { path } => {
                let data = tokio::fs::read(&path).await?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string());
                let mime = metadata
                    .get("mime_type")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| {
                        path.extension()
                            .and_then(|e| e.to_str())
                            .and_then(mime_from_extension)
                            .map(|s| s.to_string())
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let source_ref = path.to_string_lossy().to_string();
                (data, mime, filename, source_ref)
            }
        };

        // Caller-supplied MIME hint overrides detection.
        let mime_type = metadata
            .get("mime_type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(mime_type);

        let created_at = Utc::now();
        let job_id = Self::generate_job_id();
        let document_id = document_id
            .unwrap_or_else(|| Self::derive_document_id(&source_ref, tenant, created_at));
        let content_hash = Self::content_hash(&data);

        if !self.parser.is_supported(&mime_type) {
            // The job still exists so callers can observe the failure; it is
            // terminal from birth and never retried.
            let job = IndexingJob {
                job_id: job_id.clone(),
                tenant: tenant.to_string(),
                document_id,
                source: DocumentSource::Bytes {
                    data: Vec::new(),
                    mime_type: mime_type.clone(),
                    filename,
                },
                metadata,
                priority,
                status: JobStatus::Failed,
                created_at,
                started_at: None,
                completed_at: Some(created_at),
                error_message: Some(format!("Unsupported document type: {}", mime_type)),
                error_kind: Some(ErrorKind::UnsupportedType),
                chunks_created: 0,
                processing_time: Some(0.0),
                progress: JobProgress::default(),
                retry_count: 0,
                content_hash,
                from_cache: false,
            };
            let snapshot = job.snapshot();
            self.failed
                .lock()
                .await
                .insert(job_id.clone(), Arc::new(Mutex::new(job)));
            self.update_metrics_for_failure(0.0).await;
            warn!("Rejected submission {}: unsupported type {}", job_id, mime_type);
            return Ok(snapshot);
        }

        // Identical bytes for the same tenant inside the TTL window resolve
        // from the cache without touching the pipeline.
        if let Some(cached) = self.cache.get(tenant, &content_hash).await {
            info!(
                "Submission {} resolved from cache (document {})",
                job_id, cached.document_id
            );
            let job = IndexingJob {
                job_id: job_id.clone(),
                tenant: tenant.to_string(),
                document_id: cached.document_id.clone(),
                source: DocumentSource::Bytes {
                    data: Vec::new(),
                    mime_type,
                    filename,
                },
                metadata,
                priority,
                status: JobStatus::Completed,
                created_at,
                started_at: Some(created_at),
                completed_at: Some(created_at),
                error_message: None,
                error_kind: None,
                chunks_created: cached.chunks_created,
                processing_time: Some(cached.processing_time),
                progress: JobProgress::default(),
                retry_count: 0,
                content_hash,
                from_cache: true,
            };
            let snapshot = job.snapshot();
            self.completed
                .lock()
                .await
                .insert(job_id, Arc::new(Mutex::new(job)));
            return Ok(snapshot);
        }

        let job = IndexingJob {
            job_id: job_id.clone(),
            tenant: tenant.to_string(),
            document_id,
            source: DocumentSource::Bytes {
                data,
                mime_type,
                filename,
            },
            metadata,
            priority,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            error_kind: None,
            chunks_created: 0,
            processing_time: None,
            progress: JobProgress::default(),
            retry_count: 0,
            content_hash,
            from_cache: false,
        };
        let snapshot = job.snapshot();

        {
            let mut queue = self.queue.lock().await;
            queue.push(QueueEntry {
                priority,
                job: Arc::new(Mutex::new(job)),
            });
            // Stable sort keeps FIFO order within a priority class.
            queue.sort_by_key(|entry| entry.priority);
        }

        info!("Queued job {} for tenant {}", job_id, tenant);
        self.work_available.notify_waiters();
        Ok(snapshot)
    }

    /// Walk a directory and submit every supported file.
    ///
    /// Unsupported files are skipped with a warning. Returns job ids in
    /// submission order.
    pub async fn submit_directory(
        &self,
        directory: &Path,
        tenant: &str,
        recursive: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        if !directory.is_dir() {
            return Err(ServiceError::BadRequest(format!(
                "Directory not found: {}",
                directory.display()
            )));
        }

        let matcher = pattern
            .map(|p| {
                let escaped = regex::escape(p).replace(r"\*", ".*");
                regex::Regex::new(&format!("^{}$", escaped))
                    .map_err(|e| ServiceError::BadRequest(format!("Bad pattern: {}", e)))
            })
            .transpose()?;

        let mut files = Vec::new();
        collect_files(directory, recursive, &mut files)?;
        files.sort();

        let mut job_ids = Vec::new();
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if let Some(matcher) = &matcher {
                if !matcher.is_match(&name) {
                    continue;
                }
            }

            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(mime_from_extension)
                .is_some();
            if !supported {
                warn!("Skipping unsupported file: {}", path.display());
                continue;
            }

            let mut metadata = HashMap::new();
            metadata.insert(
                "source_directory".to_string(),
                serde_json::Value::String(directory.to_string_lossy().to_string()),
            );

            match self
                .submit(DocumentSource::File { path: path.clone() }, tenant, None, metadata, 1)
                .await
            {
                Ok(receipt) => job_ids.push(receipt.job_id),
                Err(e) => warn!("Failed to submit {}: {}", path.display(), e),
            }
        }

        info!(
            "Submitted {} documents from directory {}",
            job_ids.len(),
            directory.display()
        );
        Ok(job_ids)
    }

    /// Take the next batch of pending jobs, highest priority first
    async fn take_batch(&self, max_jobs: usize) -> Vec<SharedJob> {
        let mut queue = self.queue.lock().await;
        let n = max_jobs.min(queue.len());
        queue.drain(..n).map(|entry| entry.job).collect()
    }

    /// Process the next pending job, if any
    pub async fn process_next_job(&self) -> Option<JobSnapshot> {
        let job = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return None;
            }
            queue.remove(0).job
        };
        Some(self.process_job(job).await)
    }

    /// Process up to `max_jobs` pending jobs (defaults to the configured
    /// batch size), respecting the parallel/sequential mode.
    pub async fn process_batch(&self, max_jobs: Option<usize>) -> Vec<JobSnapshot> {
        let max_jobs = max_jobs.unwrap_or(self.config.batch_size);
        let batch = self.take_batch(max_jobs).await;
        if batch.is_empty() {
            return Vec::new();
        }

        debug!("Processing batch of {} jobs", batch.len());

        if self.config.enable_parallel_processing && self.config.max_workers > 1 {
            futures::stream::iter(batch)
                .map(|job| self.process_job(job))
                .buffer_unordered(self.config.max_workers)
                .collect::<Vec<_>>()
                .await
        } else {
            let mut results = Vec::new();
            for job in batch {
                results.push(self.process_job(job).await);
            }
            results
        }
    }

    /// Run the dispatcher loop until shutdown; intended for `tokio::spawn`
    pub async fn run(self: Arc<Self>) {
        info!("Indexer dispatcher started");
        loop {
            let batch = self.take_batch(self.config.batch_size).await;

            if batch.is_empty() {
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                if self.config.auto_retry_failed && !self.retry_failed_jobs().await.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = self.work_available.notified() => {}
                    _ = sleep(Duration::from_millis(500)) => {}
                }
                continue;
            }

            if self.config.enable_parallel_processing && self.config.max_workers > 1 {
                futures::stream::iter(batch)
                    .map(|job| self.process_job(job))
                    .buffer_unordered(self.config.max_workers)
                    .collect::<Vec<_>>()
                    .await;
            } else {
                for job in batch {
                    self.process_job(job).await;
                }
            }
        }
        info!("Indexer dispatcher stopped");
    }

    /// Drive one job through parse -> chunk -> embed -> persist
    async fn process_job(&self, job: SharedJob) -> JobSnapshot {
        let (job_id, started_at) = {
            let mut j = job.lock().await;
            j.status = JobStatus::Processing;
            j.started_at = Some(Utc::now());
            (j.job_id.clone(), j.started_at.unwrap())
        };

        self.active.lock().await.insert(job_id.clone(), Arc::clone(&job));
        info!("Processing job {}", job_id);

        let deadline = Duration::from_secs(self.config.processing_timeout_seconds);
        let outcome = match timeout(deadline, self.run_pipeline(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.config.processing_timeout_seconds)),
        };

        let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
        let snapshot = match outcome {
            Ok(chunks_created) => {
                let (snapshot, content_hash) = {
                    let mut j = job.lock().await;
                    j.progress.update("completed", 100);
                    j.status = JobStatus::Completed;
                    j.completed_at = Some(Utc::now());
                    j.chunks_created = chunks_created;
                    j.processing_time = Some(elapsed);
                    // A stage may have logged a transient error before
                    // recovering; a completed job carries none.
                    j.error_message = None;
                    (j.snapshot(), j.content_hash.clone())
                };

                self.active.lock().await.remove(&job_id);
                self.completed
                    .lock()
                    .await
                    .insert(job_id.clone(), Arc::clone(&job));

                self.cache
                    .insert(
                        &snapshot.tenant,
                        &content_hash,
                        CachedDocument {
                            job_id: snapshot.job_id.clone(),
                            document_id: snapshot.document_id.clone(),
                            chunks_created,
                            processing_time: elapsed,
                            cached_at: Utc::now(),
                        },
                    )
                    .await;

                self.update_metrics_for_success(chunks_created, elapsed).await;
                info!(
                    "Job {} completed ({} chunks in {:.3}s)",
                    job_id, chunks_created, elapsed
                );
                snapshot
            }
            Err(e) => {
                let snapshot = {
                    let mut j = job.lock().await;
                    j.status = JobStatus::Failed;
                    j.completed_at = Some(Utc::now());
                    j.error_message = Some(e.to_string());
                    j.error_kind = Some(e.kind());
                    j.processing_time = Some(elapsed);
                    j.snapshot()
                };

                self.active.lock().await.remove(&job_id);
                self.failed
                    .lock()
                    .await
                    .insert(job_id.clone(), Arc::clone(&job));

                self.update_metrics_for_failure(elapsed).await;
                error!("Job {} failed: {} ({})", job_id, e, e.kind().as_str());
                snapshot
            }
        };

        self.job_done.notify_waiters();
        snapshot
    }

    async fn run_pipeline(&self, job: &SharedJob) -> Result<usize> {
        let (data, mime_type, filename, tenant, document_id, metadata) = {
            let mut j = job.lock().await;
            j.progress.update("parsing", 10);
            match &j.source {
                DocumentSource::Bytes {
                    data,
                    mime_type,
                    filename,
                } => (
                    data.clone(),
                    mime_type.clone(),
                    filename.clone(),
                    j.tenant.clone(),
                    j.document_id.clone(),
                    j.metadata.clone(),
                ),
                DocumentSource::File { .. } => {
                    // Submission always resolves files into bytes.
                    return Err(ServiceError::BadRequest(
                        "unresolved file source in pipeline".to_string(),
                    ));
                }
            }
        };

        let parsed = call_with_retries(job, self.config.max_retries, || {
            let parser = Arc::clone(&self.parser);
            let data = data.clone();
            let mime_type = mime_type.clone();
            let filename = filename.clone();
            async move { parser.parse(&data, &mime_type, filename.as_deref()).await }
        })
        .await?;

        {
            let mut j = job.lock().await;
            j.progress.update("parsing", 30);
        }

        if parsed.text.trim().is_empty() {
            return Err(ParseError::EmptyContent.into());
        }

        {
            let mut j = job.lock().await;
            j.progress.update("chunking", 40);
        }

        let document_class = metadata
            .get("document_type")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(parsed.metadata.document_class);

        let chunks = self
            .chunker
            .chunk_document(&parsed.text, &document_id, document_class)
            .await?;

        if chunks.is_empty() {
            return Err(ChunkError::NoFragments.into());
        }

        {
            let mut j = job.lock().await;
            j.progress.update("chunking", 60);
        }

        let (expense, metadata_json) = split_caller_metadata(&metadata, document_class.as_str());

        {
            let mut j = job.lock().await;
            j.progress.update("indexing", 80);
        }

        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = call_with_retries(job, self.config.max_retries, || {
            let embedder = Arc::clone(&self.embedder);
            let contents = contents.clone();
            async move { embedder.embed_batch(&contents).await }
        })
        .await?;

        let created_at = Utc::now();
        let rows: Vec<FragmentRow> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| FragmentRow {
                fragment_id: chunk.metadata.chunk_id.clone(),
                tenant: tenant.clone(),
                document_id: document_id.clone(),
                content: chunk.content.clone(),
                vector,
                chunk_index: chunk.metadata.chunk_index,
                chunk_type: chunk.metadata.chunk_type.as_str().to_string(),
                parent_fragment_id: chunk.metadata.parent_chunk_id.clone(),
                start_char: chunk.metadata.start_char,
                end_char: chunk.metadata.end_char,
                amount: expense.amount,
                category: expense.category.clone(),
                merchant: expense.merchant.clone(),
                expense_date: expense.expense_date.clone(),
                document_type: expense.document_type.clone(),
                source_url: expense.source_url.clone(),
                metadata_json: metadata_json.clone(),
                created_at,
            })
            .collect();

        let accepted = call_with_retries(job, self.config.max_retries, || {
            let store = Arc::clone(&self.store);
            let rows = rows.clone();
            async move { store.upsert(rows).await }
        })
        .await?;

        if accepted.is_empty() {
            return Err(ChunkError::NoFragments.into());
        }

        Ok(accepted.len())
    }

    /// Re-queue failed jobs that are eligible for retry.
    ///
    /// Fatal failures and jobs that exhausted `max_retries` stay failed.
    pub async fn retry_failed_jobs(&self) -> Vec<String> {
        let mut retried = Vec::new();
        let mut failed = self.failed.lock().await;
        let mut requeue = Vec::new();

        let job_ids: Vec<String> = failed.keys().cloned().collect();
        for job_id in job_ids {
            let eligible = {
                let job = failed.get(&job_id).unwrap();
                let j = job.lock().await;
                let transient = matches!(
                    j.error_kind,
                    Some(ErrorKind::UpstreamUnavailable) | Some(ErrorKind::Timeout)
                );
                transient && j.retry_count < self.config.max_retries
            };

            if eligible {
                let job = failed.remove(&job_id).unwrap();
                let priority = {
                    let mut j = job.lock().await;
                    j.status = JobStatus::Pending;
                    j.started_at = None;
                    j.completed_at = None;
                    j.error_message = None;
                    j.error_kind = None;
                    j.retry_count += 1;
                    j.priority
                };
                requeue.push(QueueEntry { priority, job });
                retried.push(job_id);
            }
        }
        drop(failed);

        if !requeue.is_empty() {
            let mut queue = self.queue.lock().await;
            queue.extend(requeue);
            queue.sort_by_key(|entry| entry.priority);
            self.work_available.notify_waiters();
        }

        if !retried.is_empty() {
            info!("Retried {} failed jobs", retried.len());
        }
        retried
    }

    /// Clear completed job history; returns the number removed
    pub async fn clear_completed_jobs(&self) -> usize {
        let mut completed = self.completed.lock().await;
        let count = completed.len();
        completed.clear();
        info!("Cleared {} completed jobs from history", count);
        count
    }

    /// Status of a specific job, wherever it currently lives
    pub async fn job_status(&self, job_id: &str) -> Option<JobSnapshot> {
        if let Some(job) = self.active.lock().await.get(job_id) {
            return Some(job.lock().await.snapshot());
        }
        if let Some(job) = self.completed.lock().await.get(job_id) {
            return Some(job.lock().await.snapshot());
        }
        if let Some(job) = self.failed.lock().await.get(job_id) {
            return Some(job.lock().await.snapshot());
        }
        for entry in self.queue.lock().await.iter() {
            let j = entry.job.lock().await;
            if j.job_id == job_id {
                return Some(j.snapshot());
            }
        }
        None
    }

    /// Block until the job reaches a terminal state or the timeout elapses
    pub async fn wait_for_job(&self, job_id: &str, wait: Duration) -> Result<JobSnapshot> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.job_done.notified();

            if let Some(snapshot) = self.job_status(job_id).await {
                if matches!(snapshot.status, JobStatus::Completed | JobStatus::Failed) {
                    return Ok(snapshot);
                }
            } else {
                return Err(ServiceError::JobNotFound(job_id.to_string()));
            }

            if Instant::now() >= deadline {
                return Err(ServiceError::Timeout(wait.as_secs()));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Overall queue state
    pub async fn queue_status(&self) -> QueueStatus {
        let pending = self.queue.lock().await.len();
        let active = self.active.lock().await.len();
        let completed = self.completed.lock().await.len();
        let failed = self.failed.lock().await.len();

        QueueStatus {
            pending_jobs: pending,
            active_jobs: active,
            completed_jobs: completed,
            failed_jobs: failed,
            total_jobs: pending + active + completed + failed,
            metrics: self.metrics.lock().await.clone(),
        }
    }

    /// Begin cooperative shutdown: reject new submissions, then wait for
    /// in-flight work to drain up to the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.work_available.notify_waiters();

        let deadline = Instant::now() + grace;
        loop {
            let busy =
                !self.active.lock().await.is_empty() || !self.queue.lock().await.is_empty();
            if !busy || Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        info!("Indexer shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Health check aggregating the pipeline's components
    pub async fn health_check(&self) -> serde_json::Value {
        let parser = self.parser.health_check();
        let chunker = self.chunker.health_check().await;
        let store = self.store.health_check().await;

        let statuses = [&parser, &chunker, &store];
        let status = if statuses.iter().any(|s| s["status"] == "unhealthy") {
            "unhealthy"
        } else if statuses.iter().any(|s| s["status"] == "degraded") {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "parser": parser,
            "chunker": chunker,
            "vector_store": store,
            "queue": self.queue_status().await,
        })
    }

    async fn update_metrics_for_success(&self, chunks: usize, elapsed: f64) {
        let completed = self.completed.lock().await.len() as f64;
        let failed = self.failed.lock().await.len() as f64;

        let mut metrics = self.metrics.lock().await;
        metrics.total_jobs += 1;
        metrics.total_documents += 1;
        metrics.total_fragments += chunks as u64;
        metrics.total_processing_time += elapsed;
        metrics.average_processing_time = metrics.total_processing_time / metrics.total_jobs as f64;
        metrics.last_processed_at = Some(Utc::now());
        if completed + failed > 0.0 {
            metrics.success_rate = completed / (completed + failed);
        }
    }

    async fn update_metrics_for_failure(&self, elapsed: f64) {
        let completed = self.completed.lock().await.len() as f64;
        let failed = self.failed.lock().await.len() as f64;

        let mut metrics = self.metrics.lock().await;
        metrics.total_jobs += 1;
        metrics.total_processing_time += elapsed;
        metrics.average_processing_time = metrics.total_processing_time / metrics.total_jobs as f64;
        if completed + failed > 0.0 {
            metrics.success_rate = completed / (completed + failed);
        }
    }
}

/// Typed expense attributes extracted from caller metadata
#[derive(Debug, Clone, Default)]
struct ExpenseFields {
    amount: f64,
    category: String,
    merchant: String,
    expense_date: String,
    document_type: String,
    source_url: String,
}

/// Split caller metadata into typed expense columns and an opaque JSON
/// remainder. Known keys stay small by design; evolution adds columns.
fn split_caller_metadata(
    metadata: &HashMap<String, serde_json::Value>,
    default_document_type: &str,
) -> (ExpenseFields, String) {
    let mut fields = ExpenseFields {
        document_type: default_document_type.to_string(),
        ..Default::default()
    };
    let mut remainder = serde_json::Map::new();

    for (key, value) in metadata {
        match key.as_str() {
            "amount" => {
                fields.amount = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or(0.0);
            }
            "category" => fields.category = value.as_str().unwrap_or_default().to_string(),
            "merchant" => fields.merchant = value.as_str().unwrap_or_default().to_string(),
            "expense_date" => {
                fields.expense_date = value.as_str().unwrap_or_default().to_string()
            }
            "document_type" => {
                if let Some(s) = value.as_str() {
                    fields.document_type = s.to_string();
                }
            }
            "source_url" => fields.source_url = value.as_str().unwrap_or_default().to_string(),
            // mime_type is a submission hint, not fragment metadata
            "mime_type" => {}
            _ => {
                remainder.insert(key.clone(), value.clone());
            }
        }
    }

    let metadata_json = serde_json::Value::Object(remainder).to_string();
    (fields, metadata_json)
}

/// Retry a transient operation with exponential backoff and full jitter,
/// recording the latest error on the job.
///
/// Attempts are counted locally: `retry_count` on the job belongs to the
/// job-level Retry transition and is only bumped by `retry_failed_jobs`.
async fn call_with_retries<T, F, Fut>(
    job: &SharedJob,
    max_retries: usize,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_secs(2);

    for attempt in 0..=max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let jitter: f64 = rand::random::<f64>().max(0.05);
                let backoff = delay.mul_f64(jitter);
                warn!(
                    "Transient failure (attempt {}/{}): {}; retrying in {:?}",
                    attempt + 1,
                    max_retries + 1,
                    e,
                    backoff
                );
                {
                    let mut j = job.lock().await;
                    j.error_message = Some(e.to_string());
                }
                sleep(backoff).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop always returns")
}

/// Rough per-file-type processing time estimate
pub fn estimate_processing_time(file_size_bytes: u64, extension: &str) -> serde_json::Value {
    let file_size_mb = file_size_bytes as f64 / (1024.0 * 1024.0);

    let base_time_per_mb = match extension.trim_start_matches('.').to_lowercase().as_str() {
        "pdf" => 2.0,
        "docx" => 1.5,
        "txt" => 0.5,
        "jpg" | "jpeg" | "png" => 3.0,
        "tiff" | "tif" => 4.0,
        "bmp" => 2.5,
        _ => 2.0,
    };

    let parsing = (file_size_mb * base_time_per_mb * 0.3).max(1.0);
    let chunking = (file_size_mb * 0.5).max(1.0);
    let embedding = (file_size_mb * 1.0).max(2.0);
    let indexing = (file_size_mb * 0.2).max(1.0);

    let total = parsing + chunking + embedding + indexing;
    let total_with_buffer = total * 1.3 + 5.0;

    serde_json::json!({
        "total_seconds": total_with_buffer as u64,
        "total_minutes": (total_with_buffer / 60.0 * 10.0).round() / 10.0,
        "breakdown": {
            "parsing": parsing as u64,
            "chunking": chunking as u64,
            "embedding": embedding as u64,
            "indexing": indexing as u64,
            "buffer": (total_with_buffer - total) as u64,
        },
        "file_size_mb": (file_size_mb * 100.0).round() / 100.0,
        "file_type": extension,
    })
}

fn collect_files(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_files(&path, recursive, out)?;
            }
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DocumentCache;
    use crate::config::{CacheConfig, StoreConfig};
    use crate::error::EmbedError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, NamedTempFile};

    struct StubEmbedder {
        dimension: usize,
        fail_first: AtomicUsize,
    }

    impl StubEmbedder {
        fn new(dimension: usize) -> Self {
            Self {
                dimension,
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing_first(dimension: usize, failures: usize) -> Self {
            Self {
                dimension,
                fail_first: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(EmbedError::ConnectionFailed("stub outage".to_string()).into());
            }
            let mut v = vec![0.0f32; self.dimension];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dimension] += (b as f32) / 255.0;
            }
            Ok(v)
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(EmbedError::ConnectionFailed("stub outage".to_string()).into());
            }
            let mut out = Vec::with_capacity(texts.len());
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    async fn test_indexer_with_retries(
        embedder: Arc<dyn Embedder>,
        max_retries: usize,
    ) -> (Arc<DocumentIndexer>, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(
            FragmentStore::connect(StoreConfig {
                database_url: format!("sqlite:{}", temp.path().display()),
                vector_dimension: 8,
                chunk_batch_size: 10,
            })
            .await
            .unwrap(),
        );

        let indexer = DocumentIndexer::new(
            Arc::new(DocumentParser::new(None)),
            Arc::new(ChunkRouter::new(Some(Arc::clone(&embedder)))),
            embedder,
            store,
            Arc::new(DocumentCache::new(CacheConfig::default())),
            IndexerConfig {
                max_workers: 2,
                batch_size: 10,
                enable_parallel_processing: true,
                auto_retry_failed: true,
                max_retries,
                processing_timeout_seconds: 30,
            },
        );
        (Arc::new(indexer), temp)
    }

    async fn test_indexer(embedder: Arc<dyn Embedder>) -> (Arc<DocumentIndexer>, NamedTempFile) {
        test_indexer_with_retries(embedder, 3).await
    }

    fn text_source(text: &str, filename: &str) -> DocumentSource {
        DocumentSource::Bytes {
            data: text.as_bytes().to_vec(),
            mime_type: "text/plain".to_string(),
            filename: Some(filename.to_string()),
        }
    }

    #[tokio::test]
    async fn test_submit_and_process_text_document() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        let receipt = indexer
            .submit(
                text_source("Some general notes. More sentences follow here.", "notes.txt"),
                "t1",
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Pending);

        let result = indexer.process_next_job().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert!(result.chunks_created >= 1);
        assert!(result.processing_time.unwrap() >= 0.0);

        let status = indexer.job_status(&result.job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert!(status
            .progress
            .stages_completed
            .iter()
            .any(|s| s.stage == "indexing"));
    }

    #[tokio::test]
    async fn test_unsupported_type_fails_without_retry() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        let receipt = indexer
            .submit(
                DocumentSource::Bytes {
                    data: b"bytes".to_vec(),
                    mime_type: "application/x-unknown".to_string(),
                    filename: None,
                },
                "t1",
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();

        assert_eq!(receipt.status, JobStatus::Failed);
        assert_eq!(receipt.error_kind.as_deref(), Some("UnsupportedType"));

        // Fatal failures never re-queue
        let retried = indexer.retry_failed_jobs().await;
        assert!(retried.is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_fails_empty_content() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        indexer
            .submit(text_source("   \n ", "blank.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();

        let result = indexer.process_next_job().await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error_kind.as_deref(), Some("EmptyContent"));
    }

    #[tokio::test]
    async fn test_cache_suppresses_second_submission() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        let text = "Coffee receipt. Total: $4.20 at the corner cafe.";
        indexer
            .submit(text_source(text, "receipt.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();
        let first = indexer.process_next_job().await.unwrap();
        assert_eq!(first.status, JobStatus::Completed);

        let second = indexer
            .submit(text_source(text, "receipt.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();

        assert_eq!(second.status, JobStatus::Completed);
        assert!(second.from_cache);
        assert_eq!(second.document_id, first.document_id);
        assert_eq!(second.chunks_created, first.chunks_created);
        // Nothing new was queued
        assert!(indexer.process_next_job().await.is_none());
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_within_class() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        let low = indexer
            .submit(text_source("low priority text", "a.txt"), "t1", None, HashMap::new(), 3)
            .await
            .unwrap();
        let urgent_first = indexer
            .submit(text_source("urgent one text", "b.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();
        let urgent_second = indexer
            .submit(text_source("urgent two text", "c.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();

        let first = indexer.process_next_job().await.unwrap();
        let second = indexer.process_next_job().await.unwrap();
        let third = indexer.process_next_job().await.unwrap();

        assert_eq!(first.job_id, urgent_first.job_id);
        assert_eq!(second.job_id, urgent_second.job_id);
        assert_eq!(third.job_id, low.job_id);
    }

    #[tokio::test]
    async fn test_transient_embedder_failure_recovers_within_retries() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::failing_first(8, 2));
        let (indexer, _temp) = test_indexer(embedder).await;

        indexer
            .submit(
                text_source("Flaky pipeline document content here.", "doc.txt"),
                "t1",
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();

        let result = indexer.process_next_job().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        // Stage attempts are not job-level retries
        assert_eq!(result.retry_count, 0);
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn test_stage_exhaustion_still_allows_job_level_retry() {
        // Enough outages to exhaust a full pipeline run (1 + max_retries
        // attempts), then recover on the re-queued run.
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::failing_first(8, 2));
        let (indexer, _temp) = test_indexer_with_retries(embedder, 1).await;

        indexer
            .submit(
                text_source("Document behind a flaky embedder.", "doc.txt"),
                "t1",
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();

        let first = indexer.process_next_job().await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert_eq!(first.error_kind.as_deref(), Some("UpstreamUnavailable"));
        assert_eq!(first.retry_count, 0, "stage attempts must not consume the job budget");

        let retried = indexer.retry_failed_jobs().await;
        assert_eq!(retried, vec![first.job_id.clone()]);

        let second = indexer.process_next_job().await.unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.retry_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submissions() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        indexer.shutdown(Duration::from_millis(100)).await;

        let err = indexer
            .submit(text_source("text", "a.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Shutdown));
    }

    #[tokio::test]
    async fn test_metrics_after_mixed_outcomes() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        indexer
            .submit(text_source("Good document body here.", "ok.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();
        indexer
            .submit(text_source("  ", "empty.txt"), "t1", None, HashMap::new(), 1)
            .await
            .unwrap();
        indexer.process_batch(None).await;

        let status = indexer.queue_status().await;
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.metrics.total_jobs, 2);
        assert_eq!(status.metrics.total_documents, 1);
        assert!(status.metrics.total_fragments >= 1);
        assert!((status.metrics.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_submit_directory_skips_unsupported() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(embedder).await;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), "first document body").unwrap();
        std::fs::write(dir.path().join("two.txt"), "second document body").unwrap();
        std::fs::write(dir.path().join("binary.exe"), [0u8; 16]).unwrap();

        let job_ids = indexer
            .submit_directory(dir.path(), "t1", true, None)
            .await
            .unwrap();
        assert_eq!(job_ids.len(), 2);

        let job_ids = indexer
            .submit_directory(dir.path(), "t1", true, Some("one.*"))
            .await
            .unwrap();
        assert_eq!(job_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_typed_metadata_lands_in_columns() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(8));
        let (indexer, _temp) = test_indexer(Arc::clone(&embedder)).await;

        let mut metadata = HashMap::new();
        metadata.insert("amount".to_string(), serde_json::json!(12.5));
        metadata.insert("merchant".to_string(), serde_json::json!("Corner Cafe"));
        metadata.insert("category".to_string(), serde_json::json!("meals"));
        metadata.insert("note".to_string(), serde_json::json!("team breakfast"));

        indexer
            .submit(
                text_source("Breakfast receipt content for the team.", "receipt.txt"),
                "t1",
                Some("doc-meta".to_string()),
                metadata,
                1,
            )
            .await
            .unwrap();
        let result = indexer.process_next_job().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);

        let fragments = indexer.store.get_by_document("doc-meta").await.unwrap();
        assert!(!fragments.is_empty());
        assert_eq!(fragments[0].amount, 12.5);
        assert_eq!(fragments[0].merchant, "Corner Cafe");
        assert_eq!(fragments[0].category, "meals");
        assert!(fragments[0].metadata_json.contains("team breakfast"));
    }

    #[test]
    fn test_estimate_processing_time_breakdown() {
        let estimate = estimate_processing_time(2 * 1024 * 1024, ".pdf");
        assert!(estimate["total_seconds"].as_u64().unwrap() >= 5);
        assert!(estimate["breakdown"]["embedding"].as_u64().unwrap() >= 2);
        assert_eq!(estimate["file_size_mb"], 2.0);
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        let hash = DocumentIndexer::content_hash(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
