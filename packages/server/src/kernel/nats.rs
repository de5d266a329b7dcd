//! NATS notification transport.
//!
//! Lets status updates reach subscribers connected to other processes.
//! Subjects are the status topics verbatim (`status.report`, `status.scan.<hash>`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::traits::NotificationTransport;

pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .context("Failed to connect to NATS")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl NotificationTransport for NatsTransport {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(payload)?);
        self.client.publish(topic.to_string(), bytes).await?;
        Ok(())
    }
}
