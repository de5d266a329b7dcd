//! Last-known status of a url, merged from partial updates.
//!
//! The same struct is used for the stored snapshot and for updates: an update
//! leaves every field it does not mention [`Field::Unset`], and merging
//! overlays only the fields that are set.

use serde::{Deserialize, Serialize};

use crate::common::{url_key, Field};
use crate::kernel::jobs::{Artifact, Classification, JobRecord, JobStatus, WorkType};

/// Shared topic carrying every url's report status.
pub const REPORT_TOPIC: &str = "status.report";

/// Per-url topic for the scan status channel.
pub fn scan_topic(url: &str) -> String {
    format!("status.scan.{}", url_key(url))
}

/// Progress of the classification step as shown to scan subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanPhase {
    Pending,
    Scanning,
    Scanned,
    Failure,
}

impl From<JobStatus> for ScanPhase {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => ScanPhase::Pending,
            JobStatus::Started => ScanPhase::Scanning,
            JobStatus::Success => ScanPhase::Scanned,
            JobStatus::Failure => ScanPhase::Failure,
        }
    }
}

macro_rules! status_fields {
    ($($(#[$meta:meta])* $name:ident: $ty:ty,)*) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct StatusSnapshot {
            pub url: String,
            $(
                $(#[$meta])*
                #[serde(default, skip_serializing_if = "Field::is_unset")]
                pub $name: Field<$ty>,
            )*
        }

        impl StatusSnapshot {
            /// Shallow merge: set fields in `update` replace ours, unset ones keep ours.
            pub fn merge(&mut self, update: &StatusSnapshot) {
                if self.url.is_empty() {
                    self.url = update.url.clone();
                }
                $( self.$name.overlay(&update.$name); )*
            }
        }
    };
}

status_fields! {
    /// Classification or report still running
    is_processing: bool,

    // Classification
    job_status: ScanPhase,
    error: String,
    retrying: bool,
    retry_count: u32,
    site_name: String,
    threat_type: String,
    description: String,
    threat_score: i32,

    // Deep report
    report_job_status: JobStatus,
    report_ready: bool,
    is_processed: bool,
    report_last_error: String,
    report_retrying: bool,
    report_retry_count: u32,

    // Url scan / screenshot
    screenshot_job_status: JobStatus,
    screenshot_ready: bool,
    screenshot_url: String,
    screenshot_error: String,
    screenshot_retrying: bool,
    screenshot_retry_count: u32,
}

impl StatusSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Update describing a job status transition.
    ///
    /// `error` is written verbatim (`None` clears it). `retry` marks a
    /// scheduled retry with its number; a non-retry transition clears the flag.
    pub fn job_transition(
        url: &str,
        work_type: WorkType,
        status: JobStatus,
        error: Option<String>,
        retry: Option<u32>,
    ) -> Self {
        let mut update = Self::new(url);
        let retrying = Field::Value(retry.is_some());
        let retry_count = retry.map_or(Field::Unset, Field::Value);

        match work_type {
            WorkType::Classification => {
                update.is_processing = Field::Value(!status.is_terminal());
                update.job_status = Field::Value(status.into());
                update.error = error.into();
                update.retrying = retrying;
                update.retry_count = retry_count;
            }
            WorkType::Report => {
                update.is_processing = Field::Value(!status.is_terminal());
                update.report_job_status = Field::Value(status);
                update.report_ready = Field::Value(status == JobStatus::Success);
                update.is_processed = Field::Value(status == JobStatus::Success);
                update.report_last_error = error.into();
                update.report_retrying = retrying;
                update.report_retry_count = retry_count;
            }
            WorkType::UrlScan => {
                update.screenshot_job_status = Field::Value(status);
                update.screenshot_error = error.into();
                update.screenshot_retrying = retrying;
                update.screenshot_retry_count = retry_count;
            }
        }
        update
    }

    /// Same transition without touching the retry fields.
    pub fn job_progress(url: &str, work_type: WorkType, status: JobStatus) -> Self {
        let mut update = Self::job_transition(url, work_type, status, None, None);
        update.retrying = Field::Unset;
        update.report_retrying = Field::Unset;
        update.screenshot_retrying = Field::Unset;
        update.error = Field::Unset;
        update.report_last_error = Field::Unset;
        update.screenshot_error = Field::Unset;
        update
    }

    pub fn with_classification(mut self, classification: &Classification) -> Self {
        self.site_name = Field::Value(classification.site_name.clone());
        self.threat_type = Field::Value(classification.threat_type.clone());
        self.description = Field::Value(classification.description.clone());
        self.threat_score = Field::Value(classification.threat_score);
        self
    }

    /// Readiness fields derived from a stored artifact.
    pub fn with_artifact(mut self, artifact: &Artifact) -> Self {
        match artifact.work_type {
            WorkType::Classification => {
                if let Some(classification) = artifact.classification() {
                    self = self.with_classification(classification);
                }
            }
            WorkType::Report => {
                self.report_ready = Field::Value(artifact.processed);
                self.is_processed = Field::Value(artifact.processed);
            }
            WorkType::UrlScan => {
                let ready = artifact.processed && artifact.screenshot.is_some();
                self.screenshot_ready = Field::Value(ready);
                if let Some(url) = artifact.url_scan().and_then(|s| s.screenshot_url.clone()) {
                    self.screenshot_url = Field::Value(url);
                }
            }
        }
        self
    }

    /// Baseline view of one durable job record.
    pub fn from_record(record: &JobRecord) -> Self {
        let error = match record.status {
            JobStatus::Success => None,
            _ if record.last_error.is_empty() => None,
            _ => Some(record.last_error.clone()),
        };
        let mut update = Self::job_transition(&record.url, record.work_type, record.status, error, None);
        // Durable records do not know whether a retry is pending
        update.retrying = Field::Unset;
        update.report_retrying = Field::Unset;
        update.screenshot_retrying = Field::Unset;
        update
    }

    /// JSON envelope for a subscriber channel.
    pub fn to_message(&self, kind: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("type".to_string(), serde_json::Value::String(kind.to_string()));
        }
        value
    }
}
