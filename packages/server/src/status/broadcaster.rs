//! Merge-then-fan-out of status updates.

use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::StatusCache;
use super::snapshot::{scan_topic, StatusSnapshot, REPORT_TOPIC};
use crate::kernel::traits::NotificationTransport;

/// Message type on the shared report channel.
pub const STATUS_MESSAGE: &str = "status";
/// Message type on the per-url scan channel.
pub const SCAN_STATUS_MESSAGE: &str = "scan_status";

#[derive(Clone)]
pub struct Broadcaster {
    cache: StatusCache,
    transport: Arc<dyn NotificationTransport>,
}

impl Broadcaster {
    pub fn new(cache: StatusCache, transport: Arc<dyn NotificationTransport>) -> Self {
        Self { cache, transport }
    }

    /// Merge `update` into the cached snapshot and push the merged result to
    /// both channels.
    ///
    /// Never fails. Cache and transport errors are logged; when the cache is
    /// unreachable the update itself is published.
    pub async fn publish(&self, url: &str, update: StatusSnapshot) -> StatusSnapshot {
        let merged = match self.cache.merge(url, &update).await {
            Ok(merged) => merged,
            Err(e) => {
                warn!(url, error = %e, "status cache merge failed, publishing update only");
                let mut snapshot = StatusSnapshot::new(url);
                snapshot.merge(&update);
                snapshot
            }
        };

        self.send(REPORT_TOPIC, merged.to_message(STATUS_MESSAGE))
            .await;
        self.send(&scan_topic(url), merged.to_message(SCAN_STATUS_MESSAGE))
            .await;

        debug!(url, "status broadcast");
        merged
    }

    async fn send(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.transport.publish(topic, &payload).await {
            warn!(topic, error = %e, "status publish failed");
        }
    }
}
