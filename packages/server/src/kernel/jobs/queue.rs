//! Task hand-off between the dispatcher and the worker pool.
//!
//! An envelope carries everything a worker needs to run one attempt. Delayed
//! envelopes (retries) wait in a sleeping task, never while holding a lock.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use super::record::WorkType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub url: String,
    pub work_type: WorkType,
    /// Must match the job record, otherwise the attempt was superseded
    pub task_id: String,
    /// 0 for the first run, incremented on each retry
    pub attempt: u32,
    pub caller_ip: Option<String>,
}

impl TaskEnvelope {
    pub fn new(
        url: impl Into<String>,
        work_type: WorkType,
        task_id: impl Into<String>,
        caller_ip: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            work_type,
            task_id: task_id.into(),
            attempt: 0,
            caller_ip,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand an envelope to the workers after `delay`.
    async fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<()>;
}

/// Receiving half of a [`LocalTaskQueue`], drained by the worker pool.
pub type TaskReceiver = mpsc::UnboundedReceiver<TaskEnvelope>;

/// In-process queue over a tokio channel.
#[derive(Clone)]
pub struct LocalTaskQueue {
    tx: mpsc::UnboundedSender<TaskEnvelope>,
}

impl LocalTaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self
                .tx
                .send(envelope)
                .map_err(|_| anyhow!("task queue closed"));
        }

        if self.tx.is_closed() {
            return Err(anyhow!("task queue closed"));
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(envelope) {
                let envelope = e.0;
                warn!(
                    url = %envelope.url,
                    work_type = %envelope.work_type,
                    task_id = %envelope.task_id,
                    "task queue closed before delayed envelope was delivered"
                );
            }
        });
        Ok(())
    }
}
