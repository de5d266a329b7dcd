//! Subscriber side of the status channels.
//!
//! A session joins one url with its first `{"url": ...}` message. Every valid
//! message is answered with the current snapshot; later pushes are filtered to
//! the joined url. Protocol errors are answered in-band and keep the session open.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use super::broadcaster::{SCAN_STATUS_MESSAGE, STATUS_MESSAGE};
use super::snapshot::{scan_topic, StatusSnapshot, REPORT_TOPIC};
use crate::common::Field;
use crate::kernel::jobs::WorkType;
use crate::kernel::ServerKernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Shared topic, filtered per session
    Report,
    /// One topic per url
    Scan,
}

impl Channel {
    pub fn message_type(&self) -> &'static str {
        match self {
            Channel::Report => STATUS_MESSAGE,
            Channel::Scan => SCAN_STATUS_MESSAGE,
        }
    }

    pub fn topic(&self, url: &str) -> String {
        match self {
            Channel::Report => REPORT_TOPIC.to_string(),
            Channel::Scan => scan_topic(url),
        }
    }
}

/// A parsed client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub url: String,
}

impl ClientMessage {
    /// Parse `{"url": "..."}`, percent-decoding the url.
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let raw = value.get("url")?.as_str()?;
        if raw.is_empty() {
            return None;
        }
        let url = urlencoding::decode(raw)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        Some(Self { url })
    }
}

/// What the connection should do with a client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReply {
    /// First valid message: subscribe to `topic`, then send the snapshot
    Joined { url: String, topic: String },
    /// Repeat message for the joined url: send the snapshot again
    Refresh { url: String },
    /// Send an error message; the session stays open
    Error(&'static str),
}

pub struct SubscriptionSession {
    channel: Channel,
    url: Option<String>,
}

impl SubscriptionSession {
    pub fn new(channel: Channel) -> Self {
        Self { channel, url: None }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn joined_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn handle(&mut self, text: &str) -> SessionReply {
        let Some(message) = ClientMessage::parse(text) else {
            return SessionReply::Error("url required");
        };

        if let Some(joined) = &self.url {
            return if *joined == message.url {
                SessionReply::Refresh { url: message.url }
            } else {
                SessionReply::Error("url mismatch")
            };
        }

        let topic = self.channel.topic(&message.url);
        self.url = Some(message.url.clone());
        SessionReply::Joined {
            url: message.url,
            topic,
        }
    }

    /// Whether a pushed payload belongs to this session's url.
    pub fn accepts(&self, payload: &serde_json::Value) -> bool {
        match (&self.url, payload.get("url").and_then(|u| u.as_str())) {
            (Some(joined), Some(url)) => joined == url,
            _ => false,
        }
    }

    pub fn error_message(message: &str) -> serde_json::Value {
        json!({"type": "error", "message": message})
    }
}

/// Builds the "current state" answer for a newly joined subscriber.
#[derive(Clone)]
pub struct StatusReader {
    kernel: Arc<ServerKernel>,
}

impl StatusReader {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    /// Durable baseline (records and artifacts) overlaid with the cached snapshot.
    ///
    /// Lookup failures degrade to a thinner snapshot rather than an error.
    pub async fn current(&self, url: &str) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::new(url);
        let mut processing = false;

        for work_type in WorkType::ALL {
            match self.kernel.job_store.find(url, work_type).await {
                Ok(Some(record)) => {
                    if work_type != WorkType::UrlScan && !record.status.is_terminal() {
                        processing = true;
                    }
                    snapshot.merge(&StatusSnapshot::from_record(&record));
                }
                Ok(None) => {}
                Err(e) => warn!(url, work_type = %work_type, error = %e, "job record lookup failed"),
            }

            match self.kernel.artifact_store.find_artifact(url, work_type).await {
                Ok(Some(artifact)) => {
                    snapshot.merge(&StatusSnapshot::new(url).with_artifact(&artifact))
                }
                Ok(None) => {}
                Err(e) => warn!(url, work_type = %work_type, error = %e, "artifact lookup failed"),
            }
        }
        snapshot.is_processing = Field::Value(processing);

        match self.kernel.status_cache().get(url).await {
            Ok(Some(cached)) => snapshot.merge(&cached),
            Ok(None) => {}
            Err(e) => warn!(url, error = %e, "status cache read failed"),
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{JobRecord, JobStatus};
    use crate::kernel::TestDependencies;
    use crate::status::Broadcaster;

    const URL: &str = "https://x.test/login?next=/home";

    #[test]
    fn test_missing_url_is_an_error() {
        let mut session = SubscriptionSession::new(Channel::Report);
        assert_eq!(session.handle("{}"), SessionReply::Error("url required"));
        assert_eq!(session.handle(r#"{"url": 5}"#), SessionReply::Error("url required"));
        assert_eq!(session.handle("not json"), SessionReply::Error("url required"));
        assert!(session.joined_url().is_none());
    }

    #[test]
    fn test_join_then_refresh_then_mismatch() {
        let mut session = SubscriptionSession::new(Channel::Scan);

        let encoded = format!(r#"{{"url": "{}"}}"#, urlencoding::encode(URL));
        assert_eq!(
            session.handle(&encoded),
            SessionReply::Joined {
                url: URL.to_string(),
                topic: scan_topic(URL),
            }
        );
        assert_eq!(
            session.handle(&format!(r#"{{"url": "{}"}}"#, URL)),
            SessionReply::Refresh {
                url: URL.to_string()
            }
        );
        assert_eq!(
            session.handle(r#"{"url": "https://other.test"}"#),
            SessionReply::Error("url mismatch")
        );
        assert_eq!(session.joined_url(), Some(URL));
    }

    #[test]
    fn test_url_is_kept_as_sent() {
        let padded = format!(" {URL} ");
        let mut session = SubscriptionSession::new(Channel::Scan);

        assert_eq!(
            session.handle(&format!(r#"{{"url": "{padded}"}}"#)),
            SessionReply::Joined {
                url: padded.clone(),
                topic: scan_topic(&padded),
            }
        );
        assert_ne!(scan_topic(&padded), scan_topic(URL));
    }

    #[test]
    fn test_report_channel_filters_other_urls() {
        let mut session = SubscriptionSession::new(Channel::Report);
        session.handle(&format!(r#"{{"url": "{}"}}"#, URL));

        assert!(session.accepts(&json!({"type": "status", "url": URL})));
        assert!(!session.accepts(&json!({"type": "status", "url": "https://other.test"})));
    }

    #[tokio::test]
    async fn test_current_overlays_cache_on_durable_baseline() {
        let test = TestDependencies::new().into_kernel();
        test.job_store.put(
            JobRecord::builder()
                .url(URL)
                .work_type(WorkType::Report)
                .task_id("t1".to_string())
                .status(JobStatus::Started)
                .last_error("retrying (2/6): timeout".to_string())
                .build(),
        );

        let reader = StatusReader::new(test.kernel.clone());
        let baseline = reader.current(URL).await;
        assert_eq!(baseline.report_job_status, Field::Value(JobStatus::Started));
        assert_eq!(
            baseline.report_last_error,
            Field::Value("retrying (2/6): timeout".into())
        );
        assert_eq!(baseline.is_processing, Field::Value(true));

        let broadcaster: Broadcaster = test.kernel.broadcaster();
        broadcaster
            .publish(
                URL,
                StatusSnapshot::job_transition(
                    URL,
                    WorkType::Report,
                    JobStatus::Started,
                    Some("retrying (2/6): timeout".into()),
                    Some(2),
                ),
            )
            .await;

        let current = reader.current(URL).await;
        assert_eq!(current.report_retrying, Field::Value(true));
        assert_eq!(current.report_retry_count, Field::Value(2));
    }

    #[tokio::test]
    async fn test_unknown_url_has_idle_snapshot() {
        let test = TestDependencies::new().into_kernel();
        let snapshot = StatusReader::new(test.kernel.clone())
            .current("https://new.test")
            .await;

        assert_eq!(snapshot.is_processing, Field::Value(false));
        assert!(snapshot.report_job_status.is_unset());
        assert_eq!(snapshot.to_message("status")["url"], "https://new.test");
    }
}
