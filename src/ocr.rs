//! OCR engine client for image and scanned-page text recognition

use crate::config::OcrConfig;
use crate::error::{ParseError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error};

/// Result of recognising one image or page
#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    /// Average word confidence reported by the engine, 0-100
    pub confidence: f32,
}

/// Trait for OCR operations.
///
/// Recognition runs against an external engine; implementations must be
/// thread-safe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognise text in a raster image
    async fn recognize_image(&self, bytes: &[u8], mime_type: &str) -> Result<OcrResult>;

    /// Recognise text in a single rasterised PDF page (1-based)
    async fn recognize_pdf_page(&self, pdf_bytes: &[u8], page_number: u32) -> Result<OcrResult>;
}

/// HTTP-backed OCR client against a remote recognition service
pub struct HttpOcrClient {
    client: reqwest::Client,
    config: OcrConfig,
}

#[derive(Debug, Deserialize)]
struct OcrApiResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl HttpOcrClient {
    pub fn new(config: OcrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| ParseError::OcrUnavailable(e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn recognize(&self, bytes: &[u8], mime_type: &str, page: Option<u32>) -> Result<OcrResult> {
        let mut url = self.config.endpoint.clone();
        if let Some(page) = page {
            url = format!("{}?page={}", url, page);
        }

        debug!("OCR request: {} bytes to {}", bytes.len(), url);

        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .body(bytes.to_vec())
                .send(),
        )
        .await
        .map_err(|_| ParseError::OcrFailed("request timed out".to_string()))?
        .map_err(|e| ParseError::OcrUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("OCR API error: {}", error_text);
            return Err(ParseError::OcrFailed(error_text).into());
        }

        let body: OcrApiResponse = response
            .json()
            .await
            .map_err(|e| ParseError::OcrFailed(e.to_string()))?;

        Ok(OcrResult {
            text: body.text,
            confidence: body.confidence,
        })
    }
}

#[async_trait]
impl OcrEngine for HttpOcrClient {
    async fn recognize_image(&self, bytes: &[u8], mime_type: &str) -> Result<OcrResult> {
        self.recognize(bytes, mime_type, None).await
    }

    async fn recognize_pdf_page(&self, pdf_bytes: &[u8], page_number: u32) -> Result<OcrResult> {
        self.recognize(pdf_bytes, "application/pdf", Some(page_number))
            .await
    }
}
