//! Error taxonomy for job execution.
//!
//! Backends report a [`BackendError`]; the worker only cares whether the
//! failure is worth retrying, which [`ErrorKind`] answers.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// Failure reported by an analysis or scan backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream error (status={status}): {message}")]
    Upstream { status: u16, message: String },

    /// The upstream resource no longer exists and never will
    #[error("resource gone: {0}")]
    Gone(String),

    /// Response could not be parsed into the expected shape
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Request refused by the upstream (4xx other than 429)
    #[error("request rejected (status={status}): {message}")]
    Rejected { status: u16, message: String },
}

impl BackendError {
    pub fn failure_kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout(_)
            | BackendError::Connection(_)
            | BackendError::RateLimited(_)
            | BackendError::Upstream { .. } => ErrorKind::Retryable,
            BackendError::Gone(_) | BackendError::Malformed(_) | BackendError::Rejected { .. } => {
                ErrorKind::NonRetryable
            }
        }
    }

    /// Classify an HTTP status code returned by a backend.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => BackendError::RateLimited(message),
            410 => BackendError::Gone(message),
            s if s >= 500 => BackendError::Upstream { status: s, message },
            s => BackendError::Rejected { status: s, message },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            BackendError::Connection(e.to_string())
        } else if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            BackendError::from_status(status.as_u16(), e.to_string())
        } else {
            BackendError::Connection(e.to_string())
        }
    }
}

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint lost to a concurrent writer
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

/// Outcome classification of one attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Transient(_) => ErrorKind::Retryable,
            JobError::Fatal(_) => ErrorKind::NonRetryable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(m) | JobError::Fatal(m) => m,
        }
    }
}

impl From<BackendError> for JobError {
    fn from(e: BackendError) -> Self {
        match e.failure_kind() {
            ErrorKind::Retryable => JobError::Transient(e.to_string()),
            ErrorKind::NonRetryable => JobError::Fatal(e.to_string()),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) | StoreError::Database(_) => JobError::Transient(e.to_string()),
            StoreError::NotFound(_) | StoreError::Serialization(_) => {
                JobError::Fatal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            BackendError::from_status(429, "slow down").failure_kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            BackendError::from_status(502, "bad gateway").failure_kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            BackendError::from_status(410, "deleted").failure_kind(),
            ErrorKind::NonRetryable
        );
        assert_eq!(
            BackendError::from_status(400, "bad url").failure_kind(),
            ErrorKind::NonRetryable
        );
    }

    #[test]
    fn test_backend_error_maps_to_job_error() {
        let transient: JobError = BackendError::Connection("reset by peer".into()).into();
        assert!(matches!(transient, JobError::Transient(_)));
        assert!(transient.kind().should_retry());

        let fatal: JobError = BackendError::Malformed("not json".into()).into();
        assert!(matches!(fatal, JobError::Fatal(_)));
        assert!(!fatal.kind().should_retry());
    }

    #[test]
    fn test_job_error_message_is_verbatim() {
        let err: JobError = BackendError::Gone("scan abc".into()).into();
        assert_eq!(err.message(), "resource gone: scan abc");
    }
}
