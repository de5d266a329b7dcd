//! Transport combinators and a recording transport for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::warn;

use super::traits::NotificationTransport;

/// Publishes to every inner transport.
///
/// A failing transport does not stop the others; the first error is returned
/// after all have been tried.
pub struct FanoutTransport {
    transports: Vec<Arc<dyn NotificationTransport>>,
}

impl FanoutTransport {
    pub fn new(transports: Vec<Arc<dyn NotificationTransport>>) -> Self {
        Self { transports }
    }
}

#[async_trait]
impl NotificationTransport for FanoutTransport {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        let mut first_error = None;
        for transport in &self.transports {
            if let Err(e) = transport.publish(topic, payload).await {
                warn!(topic, error = %e, "transport publish failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// A published message.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Transport that tracks published messages for testing.
///
/// Can be switched into a failing mode to check that publish errors never
/// leak into job outcomes.
#[derive(Default)]
pub struct RecordingTransport {
    published: RwLock<Vec<PublishedMessage>>,
    failing: RwLock<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail.
    pub fn fail_publishes(&self, failing: bool) {
        *self.failing.write().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    /// Get published payloads for a specific topic.
    pub fn messages_for_topic(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Get the latest payload published to a topic.
    pub fn last_for_topic(&self, topic: &str) -> Option<serde_json::Value> {
        self.messages_for_topic(topic).pop()
    }

    pub fn publish_count(&self) -> usize {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Get messages grouped by topic.
    pub fn messages_by_topic(&self) -> HashMap<String, Vec<serde_json::Value>> {
        let messages = self.published.read().unwrap_or_else(|e| e.into_inner());
        let mut by_topic: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        for message in messages.iter() {
            by_topic
                .entry(message.topic.clone())
                .or_default()
                .push(message.payload.clone());
        }
        by_topic
    }

    pub fn clear(&self) {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        if *self.failing.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(anyhow!("transport unavailable"));
        }
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        Ok(())
    }
}
