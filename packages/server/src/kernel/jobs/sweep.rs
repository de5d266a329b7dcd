//! Periodic pass that finishes url scans whose screenshot was not ready in time.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifacts::{Artifact, ArtifactPayload, UrlScanResult};
use super::error::{BackendError, StoreError};
use super::record::WorkType;
use crate::kernel::ServerKernel;
use crate::status::{Broadcaster, StatusSnapshot};

const DEFAULT_BATCH_SIZE: i64 = 50;

/// What one sweep pass did with a pending scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Stored,
    /// Not finished yet; retried after the rest of the backlog
    Deferred,
    /// The provider no longer has the scan
    Dropped,
}

pub struct ScreenshotSweep {
    kernel: Arc<ServerKernel>,
    broadcaster: Broadcaster,
    batch_size: i64,
}

impl ScreenshotSweep {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self {
            broadcaster: kernel.broadcaster(),
            kernel,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// One pass. Returns how many screenshots were stored.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let pending = self
            .kernel
            .artifact_store
            .pending_screenshots(self.batch_size)
            .await?;

        let mut stored = 0;
        for artifact in pending {
            let id = artifact.id;
            // A running job will fetch the screenshot itself
            let running = self
                .kernel
                .job_store
                .find(&artifact.url, WorkType::UrlScan)
                .await?
                .is_some_and(|record| !record.status.is_terminal());
            let completion = if running {
                Completion::Deferred
            } else {
                self.complete(artifact).await?
            };

            match completion {
                Completion::Stored => stored += 1,
                Completion::Deferred => self.kernel.artifact_store.touch_artifact(id).await?,
                Completion::Dropped => {}
            }
        }

        if stored > 0 {
            info!(stored, "screenshot sweep stored screenshots");
        }
        Ok(stored)
    }

    async fn complete(&self, mut artifact: Artifact) -> Result<Completion, StoreError> {
        let Some(scan) = artifact.url_scan().cloned() else {
            return Ok(Completion::Deferred);
        };
        let url = artifact.url.clone();

        if scan.result.is_none() {
            match self.kernel.scanner.poll_result(&scan.scan_id).await {
                Ok(Some(result)) => {
                    let screenshot_url = result
                        .pointer("/task/screenshotURL")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or(scan.screenshot_url.clone());
                    artifact.payload = ArtifactPayload::UrlScan(UrlScanResult {
                        scan_id: scan.scan_id.clone(),
                        result: Some(result),
                        screenshot_url,
                    });
                    artifact = self
                        .kernel
                        .artifact_store
                        .save_artifact(artifact)
                        .await?;
                }
                Ok(None) => {
                    debug!(url = %url, scan_id = %scan.scan_id, "scan result not ready yet");
                    return Ok(Completion::Deferred);
                }
                Err(BackendError::Gone(_)) => {
                    warn!(url = %url, scan_id = %scan.scan_id, "scan result is gone, dropping it");
                    self.kernel
                        .artifact_store
                        .delete_artifact(artifact.id)
                        .await?;
                    return Ok(Completion::Dropped);
                }
                Err(e) => {
                    warn!(url = %url, scan_id = %scan.scan_id, error = %e, "scan result poll failed");
                    return Ok(Completion::Deferred);
                }
            }
        }

        let bytes = match self.kernel.scanner.fetch_screenshot(&scan.scan_id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Completion::Deferred),
            Err(e) => {
                warn!(url = %url, scan_id = %scan.scan_id, error = %e, "screenshot fetch failed");
                return Ok(Completion::Deferred);
            }
        };

        self.kernel
            .artifact_store
            .mark_processed(artifact.id, Some(bytes.clone()))
            .await?;
        artifact.processed = true;
        artifact.screenshot = Some(bytes);

        self.broadcaster
            .publish(&url, StatusSnapshot::new(&url).with_artifact(&artifact))
            .await;
        Ok(Completion::Stored)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "screenshot sweep failed");
                    }
                }
            }
        }
        debug!("screenshot sweep stopped");
    }
}
