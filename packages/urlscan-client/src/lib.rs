//! Pure urlscan.io REST API client.
//!
//! Covers the three calls a scan needs: submit a url, poll for the result,
//! and download the rendered screenshot.
//!
//! # Example
//!
//! ```rust,ignore
//! use urlscan_client::{PollOptions, UrlscanClient};
//!
//! let client = UrlscanClient::new("your-api-key".into());
//!
//! let scan_id = client.submit("https://example.com").await?;
//! let result = client.wait_for_result(&scan_id, PollOptions::default()).await?;
//! let png = client.screenshot(&scan_id).await?;
//! ```

pub mod error;
pub mod types;

use std::time::Duration;

pub use error::{Result, UrlscanError};
pub use types::{ScanResult, SubmitRequest, SubmitResponse};

const BASE_URL: &str = "https://urlscan.io";

/// Timing for [`UrlscanClient::wait_for_result`].
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Wait before the first poll; results are never ready immediately.
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct UrlscanClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl UrlscanClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.into(),
        }
    }

    /// Submit a url for scanning. Returns the scan id.
    pub async fn submit(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/api/v1/scan/", self.base_url))
            .header("api-key", &self.api_key)
            .json(&SubmitRequest::public(url))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UrlscanError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let submitted: SubmitResponse = resp.json().await?;
        let scan_id = submitted
            .scan_id()
            .ok_or(UrlscanError::MissingScanId)?
            .to_string();
        tracing::debug!(url, scan_id = %scan_id, "urlscan submission accepted");
        Ok(scan_id)
    }

    /// Fetch a scan result. `Ok(None)` means the scan is still running.
    pub async fn result(&self, scan_id: &str) -> Result<Option<ScanResult>> {
        let resp = self
            .client
            .get(format!("{}/api/v1/result/{}/", self.base_url, scan_id))
            .header("api-key", &self.api_key)
            .send()
            .await?;

        match resp.status().as_u16() {
            404 => Ok(None),
            410 => Err(UrlscanError::Gone {
                scan_id: scan_id.to_string(),
            }),
            status if !(200..300).contains(&status) => {
                let body = resp.text().await.unwrap_or_default();
                Err(UrlscanError::Api {
                    status,
                    message: body,
                })
            }
            _ => Ok(Some(resp.json().await?)),
        }
    }

    /// Poll [`Self::result`] until it is ready or the deadline passes.
    pub async fn wait_for_result(&self, scan_id: &str, options: PollOptions) -> Result<ScanResult> {
        tokio::time::sleep(options.initial_delay).await;
        let deadline = tokio::time::Instant::now() + options.timeout.max(Duration::from_secs(1));

        while tokio::time::Instant::now() < deadline {
            if let Some(result) = self.result(scan_id).await? {
                return Ok(result);
            }
            tracing::debug!(scan_id, "urlscan result not ready yet");
            tokio::time::sleep(options.interval.max(Duration::from_millis(100))).await;
        }

        Err(UrlscanError::Timeout {
            scan_id: scan_id.to_string(),
        })
    }

    /// Public location of a scan's screenshot.
    pub fn screenshot_url(&self, scan_id: &str) -> String {
        format!("{}/screenshots/{}.png", self.base_url, scan_id)
    }

    /// Download the PNG screenshot for a scan. `Ok(None)` when none exists.
    pub async fn screenshot(&self, scan_id: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .client
            .get(self.screenshot_url(scan_id))
            .header("api-key", &self.api_key)
            .send()
            .await?;

        match resp.status().as_u16() {
            404 => Ok(None),
            status if !(200..300).contains(&status) => Err(UrlscanError::Api {
                status,
                message: format!("urlscan screenshot failed for {}", scan_id),
            }),
            _ => Ok(Some(resp.bytes().await?.to_vec())),
        }
    }
}
