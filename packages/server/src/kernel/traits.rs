// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no orchestration logic.
// The dispatcher and worker are written against these so tests can swap in
// in-memory stores and scripted backends.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::kernel::jobs::{BackendError, Classification, DeepReport};

// =============================================================================
// Key-Value Trait (Infrastructure - dedup locks, status cache)
// =============================================================================

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set only if absent. Returns whether the value was written.
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Reset the TTL of an existing key. Returns false if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

// =============================================================================
// Notification Transport Trait (Infrastructure - status fan-out)
// =============================================================================

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Publish a JSON payload to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()>;
}

// =============================================================================
// Analysis Backend Trait
// =============================================================================

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Quick risk classification of a url
    async fn classify(&self, url: &str) -> std::result::Result<Classification, BackendError>;

    /// Deep report, seeded with the earlier classification
    async fn deep_scan(
        &self,
        url: &str,
        prior: &Classification,
    ) -> std::result::Result<DeepReport, BackendError>;
}

// =============================================================================
// Scan Backend Trait
// =============================================================================

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Submit a url for scanning. Returns the scan id.
    async fn submit_scan(&self, url: &str) -> std::result::Result<String, BackendError>;

    /// One poll. `None` while the scan is still running.
    async fn poll_result(
        &self,
        scan_id: &str,
    ) -> std::result::Result<Option<serde_json::Value>, BackendError>;

    /// Poll until the result is ready. Fails with a timeout at the deadline.
    async fn wait_for_result(
        &self,
        scan_id: &str,
    ) -> std::result::Result<serde_json::Value, BackendError>;

    async fn fetch_screenshot(
        &self,
        scan_id: &str,
    ) -> std::result::Result<Option<Vec<u8>>, BackendError>;

    /// Public screenshot location for a scan.
    fn screenshot_url(&self, scan_id: &str) -> String;
}
