//! Job record model: one durable state machine per (url, work type).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Error recorded on a record that was superseded by the staleness check.
pub const STALE_JOB_ERROR: &str = "stale job, auto-retrying";

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "work_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Classification,
    Report,
    UrlScan,
}

impl WorkType {
    pub const ALL: [WorkType; 3] = [WorkType::Classification, WorkType::Report, WorkType::UrlScan];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Classification => "classification",
            WorkType::Report => "report",
            WorkType::UrlScan => "url_scan",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(WorkType::Classification),
            "report" => Ok(WorkType::Report),
            "url_scan" => Ok(WorkType::UrlScan),
            other => Err(format!("unknown work type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Created, not yet executing
    #[default]
    Pending,
    /// Claimed by a worker (also while waiting out a retry backoff)
    Started,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

// ============================================================================
// Job Record
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRecord {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    pub url: String,
    pub work_type: WorkType,

    /// Correlation id of the currently dispatched attempt
    #[builder(default, setter(strip_option))]
    pub task_id: Option<String>,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub last_error: String,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,

    /// Weak link to the produced artifact
    #[builder(default, setter(strip_option))]
    pub result_ref: Option<Uuid>,

    #[builder(default, setter(strip_option))]
    pub caller_ip: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// What the row-locked decision step concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPlan {
    /// An attempt is already in flight; do not create another.
    Attach,
    /// A fresh attempt was recorded and must be handed to a worker after commit.
    Dispatch {
        task_id: String,
        /// The previous attempt was stale and has been force-failed.
        recovered_stale: bool,
    },
}

impl JobRecord {
    /// Fresh PENDING record with no dispatched attempt.
    pub fn new(url: impl Into<String>, work_type: WorkType) -> Self {
        Self::builder().url(url).work_type(work_type).build()
    }

    /// A non-terminal record that has seen a dispatch.
    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal() && self.task_id.is_some()
    }

    /// Whether an in-flight record has gone without an update for longer than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.is_in_flight() && now - self.updated_at > stale_after
    }

    /// Decide, under the caller's row lock, whether a new attempt is needed.
    ///
    /// Mutates `self` into the state that must be persisted before commit.
    pub fn plan_dispatch(
        &mut self,
        now: DateTime<Utc>,
        stale_after: Duration,
        new_task_id: String,
    ) -> DispatchPlan {
        let mut recovered_stale = false;

        if self.is_in_flight() {
            if !self.is_stale(now, stale_after) {
                return DispatchPlan::Attach;
            }
            self.status = JobStatus::Failure;
            self.last_error = STALE_JOB_ERROR.to_string();
            self.finished_at = Some(now);
            recovered_stale = true;
        }

        self.task_id = Some(new_task_id.clone());
        self.status = JobStatus::Pending;
        self.last_error.clear();
        self.started_at = None;
        self.finished_at = None;
        self.updated_at = now;

        DispatchPlan::Dispatch {
            task_id: new_task_id,
            recovered_stale,
        }
    }

    /// Record that the work is already done without running it.
    pub fn mark_success_without_run(&mut self, result_ref: Option<Uuid>, now: DateTime<Utc>) {
        self.status = JobStatus::Success;
        self.last_error.clear();
        if self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        if result_ref.is_some() {
            self.result_ref = result_ref;
        }
        self.updated_at = now;
    }

    pub fn matches_task(&self, task_id: &str) -> bool {
        self.task_id.as_deref() == Some(task_id)
    }
}

/// Fresh correlation id for a dispatched attempt.
pub fn new_task_id() -> String {
    Uuid::new_v4().simple().to_string()
}
