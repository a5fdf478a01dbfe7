//! Object-store fetch seam: resolves a source URL into document bytes

use crate::error::{FetchError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Fetched object: raw bytes plus the MIME type the store reported
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Trait for downloading document bytes from an external object store
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, source_url: &str) -> Result<FetchedObject>;
}

/// Plain HTTP(S) object fetcher
pub struct HttpObjectFetcher {
    client: reqwest::Client,
    timeout_seconds: u64,
}

impl HttpObjectFetcher {
    pub fn new(timeout_seconds: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| FetchError::DownloadFailed(e.to_string()))?;

        Ok(Self {
            client,
            timeout_seconds,
        })
    }
}

#[async_trait]
impl ObjectFetcher for HttpObjectFetcher {
    async fn fetch(&self, source_url: &str) -> Result<FetchedObject> {
        if !source_url.starts_with("http://") && !source_url.starts_with("https://") {
            return Err(FetchError::InvalidUrl(source_url.to_string()).into());
        }

        debug!("Fetching object from {}", source_url);

        let response = timeout(
            Duration::from_secs(self.timeout_seconds),
            self.client.get(source_url).send(),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(|e| FetchError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::DownloadFailed(format!(
                "HTTP {} from {}",
                response.status(),
                source_url
            ))
            .into());
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::DownloadFailed(e.to_string()))?
            .to_vec();

        info!("Fetched {} bytes ({}) from {}", bytes.len(), mime_type, source_url);
        Ok(FetchedObject { bytes, mime_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_via_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/receipt.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain; charset=utf-8")
                    .set_body_string("Total: $10.00"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpObjectFetcher::new(5).unwrap();
        let object = fetcher
            .fetch(&format!("{}/docs/receipt.txt", server.uri()))
            .await
            .unwrap();

        assert_eq!(object.mime_type, "text/plain");
        assert_eq!(object.bytes, b"Total: $10.00");
    }

    #[tokio::test]
    async fn test_invalid_scheme_rejected() {
        let fetcher = HttpObjectFetcher::new(5).unwrap();
        let err = fetcher.fetch("ftp://example.com/file").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ServiceError::Fetch(FetchError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_http_error_is_transient() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpObjectFetcher::new(5).unwrap();
        let err = fetcher
            .fetch(&format!("{}/gone", server.uri()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
