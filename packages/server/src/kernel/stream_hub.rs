//! In-process pub/sub hub for status streaming.
//!
//! Topic-keyed broadcast channels feeding the WebSocket status endpoints.
//! Topics are opaque strings; the hub has no knowledge of what's being streamed.
//!
//! # Usage
//!
//! Producers (the broadcaster):
//!   hub.publish("status.report", &json!({"type": "status", "url": "..."})).await;
//!
//! Consumers (WebSocket sessions):
//!   let rx = hub.subscribe("status.report").await;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::traits::NotificationTransport;

/// Thread-safe, cloneable hub keyed by string topics.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl StreamHub {
    /// Create a new StreamHub with default capacity (256 messages per channel).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Subscribe to a topic. Creates the channel if it doesn't exist.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Number of live receivers on a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .await
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationTransport for StreamHub {
    /// No-op if nobody is subscribed.
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            // Send only fails when every receiver is gone
            let _ = tx.send(payload.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = StreamHub::new();
        let mut rx1 = hub.subscribe("status.report").await;
        let mut rx2 = hub.subscribe("status.report").await;

        let value = serde_json::json!({"type": "status", "url": "https://x.test"});
        hub.publish("status.report", &value).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), value);
        assert_eq!(rx2.recv().await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = StreamHub::new();
        hub.publish("status.scan.nobody", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count("status.scan.nobody").await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_abandoned_topics() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("status.scan.abc").await;
        assert_eq!(hub.subscriber_count("status.scan.abc").await, 1);

        drop(rx);
        hub.cleanup().await;

        assert_eq!(hub.channels.read().await.len(), 0);
    }
}
