//! End-to-end tests for the ingest pipeline


use expense_rag::{DocumentSource, JobStatus};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::build_test_service;

fn text_source(text: &str, filename: &str) -> DocumentSource {
    DocumentSource::Bytes {
        data: text.as_bytes().to_vec(),
        mime_type: "text/plain".to_string(),
        filename: Some(filename.to_string()),
    }
}

const RECEIPT_TEXT: &str = "RECEIPT\n\
    Starbucks Coffee Company\n\
    Merchant: Starbucks #2291\n\
    Date of transaction 04/12/2024\n\
    Item: grande latte with oat milk\n\
    Item: blueberry muffin fresh baked\n\
    Total amount due $11.45\n\
    Tax included $0.95\n\
    Thank you for visiting, come again soon";

#[tokio::test]
async fn test_receipt_ingest_end_to_end() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    let receipt = service
        .indexer
        .submit(
            text_source(RECEIPT_TEXT, "starbucks_receipt.txt"),
            "t1",
            None,
            HashMap::new(),
            1,
        )
        .await
        .unwrap();
    let result = service.indexer.process_next_job().await.unwrap();

    assert_eq!(result.job_id, receipt.job_id);
    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.chunks_created >= 3, "expense sections should split");

    // Fragments carry the detected class in their typed column
    let fragments = service
        .store
        .get_by_document(&result.document_id)
        .await
        .unwrap();
    assert_eq!(fragments.len(), result.chunks_created);
    assert!(fragments.iter().all(|f| f.tenant == "t1"));
    assert!(fragments
        .iter()
        .all(|f| f.vector.len() == test_helpers::TEST_DIMENSION));
    assert_eq!(fragments[0].document_type, "expense_document");

    // A search for the merchant surfaces a fragment containing it
    let response = service
        .search
        .search("starbucks coffee", "t1", 10, "vector", None, true)
        .await;
    assert!(response.total_results >= 1);
    assert!(response
        .results
        .iter()
        .any(|r| r.content.to_lowercase().contains("starbucks")));
}

#[tokio::test]
async fn test_duplicate_submission_hits_cache() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    service
        .indexer
        .submit(text_source(RECEIPT_TEXT, "receipt.txt"), "t1", None, HashMap::new(), 1)
        .await
        .unwrap();
    let first = service.indexer.process_next_job().await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    let count_after_first = service.store.count_for_tenant("t1").await.unwrap();

    let second = service
        .indexer
        .submit(text_source(RECEIPT_TEXT, "receipt.txt"), "t1", None, HashMap::new(), 1)
        .await
        .unwrap();

    assert_eq!(second.status, JobStatus::Completed);
    assert!(second.from_cache);
    assert_eq!(second.document_id, first.document_id);

    // Exactly one ingestion happened
    assert!(service.indexer.process_next_job().await.is_none());
    assert_eq!(
        service.store.count_for_tenant("t1").await.unwrap(),
        count_after_first
    );
}

#[tokio::test]
async fn test_same_bytes_different_tenants_both_ingest() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    for tenant in ["t1", "t2"] {
        service
            .indexer
            .submit(
                text_source("A latte every single morning.", "note.txt"),
                tenant,
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();
        let result = service.indexer.process_next_job().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed, "tenant {}", tenant);
    }

    assert_eq!(service.store.count_for_tenant("t1").await.unwrap(), 1);
    assert_eq!(service.store.count_for_tenant("t2").await.unwrap(), 1);
}

#[tokio::test]
async fn test_chunk_concatenation_covers_source_words() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    let text = "Meeting notes from the planning session. We discussed quarterly \
                targets and hiring. The infrastructure budget was approved in \
                full. Several deadlines moved to accommodate the launch. Follow \
                ups were assigned to the platform team for next week.";

    service
        .indexer
        .submit(
            text_source(text, "notes.txt"),
            "t1",
            Some("doc-coverage".to_string()),
            HashMap::new(),
            1,
        )
        .await
        .unwrap();
    let result = service.indexer.process_next_job().await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);

    let fragments = service.store.get_by_document("doc-coverage").await.unwrap();
    let mut indices: Vec<usize> = fragments.iter().map(|f| f.chunk_index).collect();
    let sorted = {
        let mut s = indices.clone();
        s.sort();
        s
    };
    assert_eq!(indices, sorted, "get_by_document orders by chunk_index");
    indices.dedup();
    assert_eq!(indices.len(), fragments.len(), "chunk_index is unique");

    // Concatenation by chunk_index covers the source text up to whitespace
    let concatenated: String = fragments
        .iter()
        .map(|f| f.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    for word in text.split_whitespace() {
        assert!(
            concatenated.contains(word),
            "word '{}' missing from fragment coverage",
            word
        );
    }
}

#[tokio::test]
async fn test_delete_then_get_by_document_is_empty() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    service
        .indexer
        .submit(
            text_source(RECEIPT_TEXT, "receipt.txt"),
            "t1",
            Some("doc-del".to_string()),
            HashMap::new(),
            1,
        )
        .await
        .unwrap();
    let result = service.indexer.process_next_job().await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);

    let removed = service.delete_document("doc-del").await.unwrap();
    assert_eq!(removed as usize, result.chunks_created);
    assert!(service.store.get_by_document("doc-del").await.unwrap().is_empty());

    // The cache no longer points at the deleted document, so the same
    // bytes re-ingest instead of short-circuiting to stale data.
    let resubmit = service
        .indexer
        .submit(text_source(RECEIPT_TEXT, "receipt.txt"), "t1", None, HashMap::new(), 1)
        .await
        .unwrap();
    assert!(!resubmit.from_cache);
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;
    service.start().await;

    let mut job_ids = Vec::new();
    for i in 0..5 {
        let receipt = service
            .indexer
            .submit(
                text_source(
                    &format!("Document number {} with unique content body.", i),
                    &format!("doc{}.txt", i),
                ),
                "t1",
                None,
                HashMap::new(),
                1,
            )
            .await
            .unwrap();
        job_ids.push(receipt.job_id);
    }

    for job_id in &job_ids {
        let snapshot = service
            .indexer
            .wait_for_job(job_id, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
    }

    let status = service.indexer.queue_status().await;
    assert_eq!(status.pending_jobs, 0);
    assert_eq!(status.active_jobs, 0);
    assert_eq!(status.completed_jobs, 5);
    assert_eq!(status.metrics.total_documents, 5);

    service.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_single_short_document_single_fragment() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    service
        .indexer
        .submit(
            text_source("tiny note", "tiny.txt"),
            "t1",
            Some("doc-tiny".to_string()),
            HashMap::new(),
            1,
        )
        .await
        .unwrap();
    let result = service.indexer.process_next_job().await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.chunks_created, 1);

    let fragments = service.store.get_by_document("doc-tiny").await.unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].content, "tiny note");
}

#[tokio::test]
async fn test_completed_job_rowcount_matches_store() {
    let dir = TempDir::new().unwrap();
    let service = build_test_service(&dir).await;

    service
        .indexer
        .submit(
            text_source(RECEIPT_TEXT, "receipt.txt"),
            "t1",
            Some("doc-count".to_string()),
            HashMap::new(),
            1,
        )
        .await
        .unwrap();
    let result = service.indexer.process_next_job().await.unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert!(result.chunks_created >= 1);
    let stored = service.store.get_by_document("doc-count").await.unwrap();
    assert_eq!(stored.len(), result.chunks_created);
}
