//! Dispatch decisions for incoming job requests.
//!
//! Two phases: [`Dispatcher::decide`] runs the dedup lock and the row-locked
//! record decision and returns once the outcome is committed;
//! [`Dispatcher::dispatch`] then hands a `Dispatch` decision to the task queue.
//! Nothing is enqueued before the record is durable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::StoreError;
use super::lock::{DedupLock, LockKey};
use super::queue::TaskEnvelope;
use super::record::{DispatchPlan, JobRecord, JobStatus, WorkType};
use crate::kernel::ServerKernel;
use crate::status::{Broadcaster, StatusSnapshot};

/// Committed outcome of a job request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDecision {
    /// A processed artifact already exists; the record was upserted to SUCCESS.
    Skip { record: JobRecord },
    /// An attempt is already in flight for this url and work type.
    Attach { record: JobRecord },
    /// A fresh attempt was recorded and must be dispatched.
    Dispatch { record: JobRecord, task_id: String },
}

impl DispatchDecision {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchDecision::Skip { .. } => "skipped",
            DispatchDecision::Attach { .. } => "attached",
            DispatchDecision::Dispatch { .. } => "dispatched",
        }
    }

    pub fn record(&self) -> &JobRecord {
        match self {
            DispatchDecision::Skip { record }
            | DispatchDecision::Attach { record }
            | DispatchDecision::Dispatch { record, .. } => record,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        self.record().task_id.as_deref()
    }
}

/// Result of [`Dispatcher::request_job`].
#[derive(Debug, Clone, Serialize)]
pub struct JobRequestOutcome {
    /// True only when this request dispatched a new attempt
    pub accepted: bool,
    pub job_id: Option<Uuid>,
    pub task_id: Option<String>,
    pub decision: &'static str,
    #[serde(skip)]
    pub status: Option<JobStatus>,
}

impl From<&DispatchDecision> for JobRequestOutcome {
    fn from(decision: &DispatchDecision) -> Self {
        Self {
            accepted: matches!(decision, DispatchDecision::Dispatch { .. }),
            job_id: Some(decision.record().id),
            task_id: decision.task_id().map(str::to_string),
            decision: decision.label(),
            status: Some(decision.record().status),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue task: {0}")]
    Enqueue(String),
}

/// Replans after a unique-key race before giving up.
const MAX_PLAN_CONFLICTS: usize = 3;

#[derive(Clone)]
pub struct Dispatcher {
    kernel: Arc<ServerKernel>,
    lock: DedupLock,
    broadcaster: Broadcaster,
}

impl Dispatcher {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self {
            lock: kernel.lock(),
            broadcaster: kernel.broadcaster(),
            kernel,
        }
    }

    /// Decide and, when a new attempt is needed, dispatch it.
    pub async fn request_job(
        &self,
        url: &str,
        work_type: WorkType,
        caller_ip: Option<String>,
    ) -> Result<JobRequestOutcome, DispatchError> {
        let decision = self.decide(url, work_type, caller_ip.as_deref()).await?;
        self.dispatch(&decision, caller_ip).await?;

        info!(
            url,
            work_type = %work_type,
            decision = decision.label(),
            task_id = decision.task_id().unwrap_or_default(),
            "job requested"
        );
        Ok(JobRequestOutcome::from(&decision))
    }

    /// Phase one: the committed decision. Holds the dedup lock on `Dispatch`.
    ///
    /// A held lock never short-circuits the decision: the row-locked plan
    /// waits for a peer's uncommitted record and attaches to it.
    pub async fn decide(
        &self,
        url: &str,
        work_type: WorkType,
        caller_ip: Option<&str>,
    ) -> Result<DispatchDecision, StoreError> {
        let store = &self.kernel.job_store;

        if let Some(artifact) = self
            .kernel
            .artifact_store
            .find_artifact(url, work_type)
            .await?
            .filter(|a| a.processed)
        {
            let record = store
                .mark_success_without_run(url, work_type, Some(artifact.id))
                .await?;
            return Ok(DispatchDecision::Skip { record });
        }

        let key = LockKey::new(work_type, url);
        let ttl = self.kernel.config.lock_ttl;
        let acquired = self.lock.try_acquire(&key, ttl).await;
        if !acquired {
            debug!(url, work_type = %work_type, "dedup lock held, deciding on the record");
        }

        let mut conflicts = 0;
        let planned = loop {
            let attempt = store
                .plan_dispatch(
                    url,
                    work_type,
                    caller_ip,
                    Utc::now(),
                    self.kernel.config.stale_window(),
                )
                .await;
            match attempt {
                Err(StoreError::Conflict(reason)) if conflicts < MAX_PLAN_CONFLICTS => {
                    conflicts += 1;
                    debug!(
                        url,
                        work_type = %work_type,
                        reason = %reason,
                        conflicts,
                        "lost record creation race, replanning"
                    );
                }
                other => break other,
            }
        };

        match planned {
            // The in-flight attempt owns the lock, whoever took it
            Ok((DispatchPlan::Attach, record)) => Ok(DispatchDecision::Attach { record }),
            Ok((
                DispatchPlan::Dispatch {
                    task_id,
                    recovered_stale,
                },
                record,
            )) => {
                if recovered_stale {
                    warn!(
                        url,
                        work_type = %work_type,
                        task_id = %task_id,
                        "stale job force-failed, dispatching a fresh attempt"
                    );
                }
                if !acquired {
                    // Leftover lock with nothing in flight; the new attempt takes it over
                    self.lock.refresh(&key, ttl).await;
                }
                Ok(DispatchDecision::Dispatch { record, task_id })
            }
            Err(e) => {
                if acquired {
                    self.lock.release(&key).await;
                }
                Err(e)
            }
        }
    }

    /// Phase two: hand a committed `Dispatch` to the workers and announce it.
    ///
    /// Other decisions only refresh subscribers where there is something to say.
    pub async fn dispatch(
        &self,
        decision: &DispatchDecision,
        caller_ip: Option<String>,
    ) -> Result<(), DispatchError> {
        match decision {
            DispatchDecision::Dispatch { record, task_id } => {
                let envelope =
                    TaskEnvelope::new(&record.url, record.work_type, task_id.clone(), caller_ip);

                if let Err(e) = self.kernel.task_queue.enqueue(envelope, Duration::ZERO).await {
                    let message = format!("failed to enqueue task: {}", e);
                    error!(url = %record.url, work_type = %record.work_type, task_id = %task_id, error = %e, "dispatch failed");

                    self.kernel
                        .job_store
                        .mark_failed(&record.url, record.work_type, task_id, &message)
                        .await?;
                    self.lock
                        .release(&LockKey::new(record.work_type, &record.url))
                        .await;
                    self.broadcaster
                        .publish(
                            &record.url,
                            StatusSnapshot::job_transition(
                                &record.url,
                                record.work_type,
                                JobStatus::Failure,
                                Some(message),
                                None,
                            ),
                        )
                        .await;
                    return Err(DispatchError::Enqueue(e.to_string()));
                }

                self.broadcaster
                    .publish(
                        &record.url,
                        StatusSnapshot::job_transition(
                            &record.url,
                            record.work_type,
                            JobStatus::Pending,
                            None,
                            None,
                        ),
                    )
                    .await;
            }
            DispatchDecision::Skip { record } => {
                let mut update = StatusSnapshot::job_transition(
                    &record.url,
                    record.work_type,
                    JobStatus::Success,
                    None,
                    None,
                );
                if let Some(artifact) = self
                    .kernel
                    .artifact_store
                    .find_artifact(&record.url, record.work_type)
                    .await?
                {
                    update = update.with_artifact(&artifact);
                }
                self.broadcaster.publish(&record.url, update).await;
            }
            DispatchDecision::Attach { .. } => {}
        }
        Ok(())
    }
}
