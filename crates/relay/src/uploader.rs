//! Batch delivery to the collector.

use async_trait::async_trait;
use engine_core::{Error, Result, UploadBatch, UploadReceipt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, warn};
use url::Url;

use crate::upstream::Upstream;

/// Delivers one session batch upstream.
///
/// `Err(Error::UpstreamUnknown)` means the batch was not sent and must be
/// kept; any other error means the batch was offered and failed.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn send(&self, batch: &UploadBatch) -> Result<UploadReceipt>;
}

/// Uploads batches as JSON to `<endpoint>/upload`.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    http_client: reqwest::Client,
    upstream: Arc<Upstream>,
}

impl HttpUploader {
    pub fn new(upstream: Arc<Upstream>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            upstream,
        })
    }
}

/// `<endpoint>/upload`, tolerating endpoints with or without a trailing slash.
pub fn upload_url(endpoint: &Url) -> Result<Url> {
    let base = endpoint.as_str().trim_end_matches('/');
    Url::parse(&format!("{}/upload", base))
        .map_err(|e| Error::config(format!("bad upload url for {}: {}", endpoint, e)))
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn send(&self, batch: &UploadBatch) -> Result<UploadReceipt> {
        if batch.is_empty() {
            return Err(Error::no_payload(format!("empty batch for {}", batch.session_id)));
        }

        let endpoint = self.upstream.target_for(&batch.session_id)?;
        let url = upload_url(&endpoint)?;
        let start = Instant::now();

        let response = self
            .http_client
            .post(url.clone())
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::transport(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Collector rejected upload");
            return Err(Error::transport(format!("collector returned {}", status)));
        }

        let receipt: UploadReceipt = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("invalid upload response: {}", e)))?;

        let elapsed = start.elapsed();
        metrics().upload_latency_ms.observe(elapsed.as_millis() as u64);

        debug!(
            session_id = %batch.session_id,
            count = batch.len(),
            accepted = receipt.count,
            latency_ms = %elapsed.as_millis(),
            "Uploaded batch"
        );

        Ok(receipt)
    }
}
