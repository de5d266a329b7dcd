//! Job execution and retry scheduling.
//!
//! [`Worker::process`] runs one attempt described by a [`TaskEnvelope`]:
//!
//! ```text
//! envelope ──► still current? ──no──► Superseded
//!                   │yes
//!                   ▼
//!           artifact done? ──yes──► SUCCESS (no backend call)
//!                   │no
//!                   ▼
//!           claim STARTED ──► handler
//!                               ├─ ok ─────────────► SUCCESS, release lock
//!                               ├─ transient, budget ► STARTED "retrying n/m",
//!                               │                      refresh lock, re-enqueue after backoff
//!                               └─ otherwise ───────► FAILURE, release lock
//! ```
//!
//! Every transition is written to the job record first, then broadcast.
//! [`WorkerPool`] drains the task queue with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::artifacts::Artifact;
use super::dispatcher::Dispatcher;
use super::error::{JobError, StoreError};
use super::handlers;
use super::lock::{DedupLock, LockKey};
use super::queue::{TaskEnvelope, TaskReceiver};
use super::record::{JobStatus, WorkType};
use crate::common::Field;
use crate::kernel::ServerKernel;
use crate::status::{Broadcaster, StatusSnapshot};

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Result already existed; the backend was not called
    Skipped,
    RetryScheduled { delay: Duration },
    Failed(String),
    /// The envelope no longer matches the record's current attempt
    Superseded,
}

#[derive(Clone)]
pub struct Worker {
    kernel: Arc<ServerKernel>,
    dispatcher: Dispatcher,
    lock: DedupLock,
    broadcaster: Broadcaster,
}

impl Worker {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self {
            dispatcher: Dispatcher::new(kernel.clone()),
            lock: kernel.lock(),
            broadcaster: kernel.broadcaster(),
            kernel,
        }
    }

    #[instrument(
        skip(self, envelope),
        fields(
            url = %envelope.url,
            work_type = %envelope.work_type,
            task_id = %envelope.task_id,
            attempt = envelope.attempt,
        )
    )]
    pub async fn process(&self, envelope: TaskEnvelope) -> Result<JobOutcome, StoreError> {
        let (url, work_type, task_id) = (&envelope.url, envelope.work_type, &envelope.task_id);
        let store = &self.kernel.job_store;

        match store.find(url, work_type).await? {
            Some(record) if record.matches_task(task_id) && !record.status.is_terminal() => {}
            _ => {
                debug!("envelope superseded, dropping");
                return Ok(JobOutcome::Superseded);
            }
        }

        if let Some(artifact) = self
            .kernel
            .artifact_store
            .find_artifact(url, work_type)
            .await?
            .filter(|a| a.processed)
        {
            if !store
                .mark_succeeded(url, work_type, task_id, Some(artifact.id))
                .await?
            {
                return Ok(JobOutcome::Superseded);
            }
            info!("result already present, skipping backend call");
            self.finish_success(&envelope, &artifact).await;
            return Ok(JobOutcome::Skipped);
        }

        if store.claim(url, work_type, task_id).await?.is_none() {
            return Ok(JobOutcome::Superseded);
        }
        self.broadcaster
            .publish(
                url,
                StatusSnapshot::job_progress(url, work_type, JobStatus::Started),
            )
            .await;

        match handlers::run(&self.kernel, &envelope).await {
            Ok(artifact) => {
                if !store
                    .mark_succeeded(url, work_type, task_id, Some(artifact.id))
                    .await?
                {
                    return Ok(JobOutcome::Superseded);
                }
                info!("job succeeded");
                self.finish_success(&envelope, &artifact).await;
                Ok(JobOutcome::Succeeded)
            }
            Err(e) => self.handle_failure(&envelope, e).await,
        }
    }

    async fn handle_failure(
        &self,
        envelope: &TaskEnvelope,
        e: JobError,
    ) -> Result<JobOutcome, StoreError> {
        let (url, work_type, task_id) = (&envelope.url, envelope.work_type, &envelope.task_id);
        let policy = self.kernel.config.retry_policy(work_type);

        let message = if e.kind().should_retry() && policy.allows_retry(envelope.attempt) {
            let retry_number = envelope.attempt + 1;
            let delay = policy.delay(envelope.attempt);
            let message = format!(
                "retrying ({}/{}): {}",
                retry_number,
                policy.max_retries,
                e.message()
            );

            if !self
                .kernel
                .job_store
                .mark_retrying(url, work_type, task_id, &message)
                .await?
            {
                return Ok(JobOutcome::Superseded);
            }

            match self
                .kernel
                .task_queue
                .enqueue(envelope.next_attempt(), delay)
                .await
            {
                Ok(()) => {
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retry scheduled"
                    );
                    self.lock
                        .refresh(
                            &LockKey::new(work_type, url),
                            delay + self.kernel.config.lock_ttl,
                        )
                        .await;
                    self.broadcaster
                        .publish(
                            url,
                            StatusSnapshot::job_transition(
                                url,
                                work_type,
                                JobStatus::Started,
                                Some(message),
                                Some(retry_number),
                            ),
                        )
                        .await;
                    return Ok(JobOutcome::RetryScheduled { delay });
                }
                Err(enqueue_error) => format!("failed to schedule retry: {}", enqueue_error),
            }
        } else if e.kind().should_retry() {
            format!(
                "gave up after {} retries: {}",
                policy.max_retries,
                e.message()
            )
        } else {
            e.message().to_string()
        };

        if !self
            .kernel
            .job_store
            .mark_failed(url, work_type, task_id, &message)
            .await?
        {
            return Ok(JobOutcome::Superseded);
        }
        error!(error = %message, "job failed");

        self.lock.release(&LockKey::new(work_type, url)).await;
        self.broadcaster
            .publish(
                url,
                StatusSnapshot::job_transition(
                    url,
                    work_type,
                    JobStatus::Failure,
                    Some(message.clone()),
                    None,
                ),
            )
            .await;
        Ok(JobOutcome::Failed(message))
    }

    /// Release the lock, chain follow-up work and announce the result.
    async fn finish_success(&self, envelope: &TaskEnvelope, artifact: &Artifact) {
        let (url, work_type) = (&envelope.url, envelope.work_type);
        self.lock.release(&LockKey::new(work_type, url)).await;

        let mut update =
            StatusSnapshot::job_transition(url, work_type, JobStatus::Success, None, None)
                .with_artifact(artifact);

        if work_type == WorkType::Classification {
            match self
                .dispatcher
                .request_job(url, WorkType::Report, envelope.caller_ip.clone())
                .await
            {
                Ok(outcome) => {
                    if let Some(status) = outcome.status {
                        update.report_job_status = Field::Value(status);
                        update.is_processing = Field::Value(!status.is_terminal());
                    }
                }
                Err(e) => warn!(error = %e, "failed to request report after classification"),
            }
        }

        self.broadcaster.publish(url, update).await;
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Maximum jobs running at once
    pub concurrency: usize,
    /// How long shutdown waits for running jobs
    pub shutdown_timeout: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            shutdown_timeout: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

pub struct WorkerPool {
    worker: Worker,
    config: JobWorkerConfig,
}

impl WorkerPool {
    pub fn new(worker: Worker, config: JobWorkerConfig) -> Self {
        Self { worker, config }
    }

    /// Drain `tasks` until shutdown or until every sender is gone.
    pub async fn run(self, mut tasks: TaskReceiver, shutdown: CancellationToken) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        info!(
            worker_id = %self.config.worker_id,
            concurrency,
            "worker pool starting"
        );

        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = tasks.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Record stays PENDING until stale recovery picks it up
                    warn!(url = %envelope.url, task_id = %envelope.task_id, "dropping envelope at shutdown");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit?,
            };

            let worker = self.worker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let (url, task_id) = (envelope.url.clone(), envelope.task_id.clone());
                match worker.process(envelope).await {
                    Ok(outcome) => debug!(url = %url, task_id = %task_id, ?outcome, "envelope processed"),
                    Err(e) => error!(url = %url, task_id = %task_id, error = %e, "job store failure, leaving job for stale recovery"),
                }
            });
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopping, waiting for running jobs");
        match tokio::time::timeout(
            self.config.shutdown_timeout,
            semaphore.acquire_many(concurrency as u32),
        )
        .await
        {
            Ok(_) => info!("worker pool stopped"),
            Err(_) => warn!("shutdown timeout reached with jobs still running"),
        }
        Ok(())
    }
}
