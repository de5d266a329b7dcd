use serde::{Deserialize, Serialize};

/// Body for `POST /api/v1/scan`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    pub url: String,
    pub visibility: String,
}

impl SubmitRequest {
    pub fn public(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            visibility: "public".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    pub uuid: Option<String>,
}

/// Response from a scan submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub uuid: Option<String>,
    pub message: Option<String>,
    pub result: Option<String>,
    pub task: Option<TaskRef>,
}

impl SubmitResponse {
    /// The scan id, from the top-level `uuid` or the nested `task.uuid`.
    pub fn scan_id(&self) -> Option<&str> {
        self.uuid
            .as_deref()
            .or_else(|| self.task.as_ref().and_then(|t| t.uuid.as_deref()))
    }
}

/// A finished scan result. Kept as raw JSON; only a few fields are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanResult(pub serde_json::Value);

impl ScanResult {
    /// `task.screenshotURL`, when urlscan already rendered one.
    pub fn screenshot_url(&self) -> Option<&str> {
        self.0
            .get("task")
            .and_then(|t| t.get("screenshotURL"))
            .and_then(|u| u.as_str())
            .filter(|u| !u.is_empty())
    }
}
