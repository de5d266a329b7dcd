//! Result artifacts produced by jobs.
//!
//! An artifact's lifecycle is independent of the job record that produced it;
//! records only hold its id.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::StoreError;
use super::record::WorkType;

/// Quick verdict from the analysis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub site_name: String,
    pub threat_type: String,
    pub description: String,
    /// 1 = safe, 2 = caution, 3 = dangerous
    pub threat_score: i32,
}

/// Deep analysis report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepReport {
    pub url: String,
    pub site_name: String,
    pub threat_type: String,
    pub description: String,
    pub probability: f64,
    #[serde(default)]
    pub reason: Option<String>,
    /// Redirect / link tree explored by the backend
    #[serde(default)]
    pub depth: Option<serde_json::Value>,
}

impl DeepReport {
    /// Strip empty markdown link debris from the free-text fields.
    pub fn cleaned(mut self) -> Self {
        self.description = clean_markdown(&self.description);
        self.reason = self.reason.map(|r| clean_markdown(&r));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlScanResult {
    pub scan_id: String,
    /// Raw result document, absent until the scan finished
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub screenshot_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactPayload {
    Classification(Classification),
    DeepReport(DeepReport),
    UrlScan(UrlScanResult),
}

impl ArtifactPayload {
    pub fn work_type(&self) -> WorkType {
        match self {
            ArtifactPayload::Classification(_) => WorkType::Classification,
            ArtifactPayload::DeepReport(_) => WorkType::Report,
            ArtifactPayload::UrlScan(_) => WorkType::UrlScan,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub url: String,
    pub work_type: WorkType,
    /// Whether consumers may treat the artifact as final
    pub processed: bool,
    pub payload: ArtifactPayload,
    pub screenshot: Option<Vec<u8>>,
    pub caller_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(url: impl Into<String>, payload: ArtifactPayload, processed: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            url: url.into(),
            work_type: payload.work_type(),
            processed,
            payload,
            screenshot: None,
            caller_ip: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_caller_ip(mut self, caller_ip: Option<String>) -> Self {
        self.caller_ip = caller_ip;
        self
    }

    pub fn classification(&self) -> Option<&Classification> {
        match &self.payload {
            ArtifactPayload::Classification(c) => Some(c),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<&DeepReport> {
        match &self.payload {
            ArtifactPayload::DeepReport(r) => Some(r),
            _ => None,
        }
    }

    pub fn url_scan(&self) -> Option<&UrlScanResult> {
        match &self.payload {
            ArtifactPayload::UrlScan(s) => Some(s),
            _ => None,
        }
    }
}

/// Remove empty markdown links and brackets (`[]()`, `()[]`, `[]`, `()`).
pub fn clean_markdown(text: &str) -> String {
    ["[]()", "()[]", "[]", "()"]
        .iter()
        .fold(text.to_string(), |acc, debris| acc.replace(debris, ""))
        .trim()
        .to_string()
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn find_artifact(&self, url: &str, work_type: WorkType)
        -> Result<Option<Artifact>, StoreError>;

    /// Upsert by (url, work type). An existing row keeps its id.
    async fn save_artifact(&self, artifact: Artifact) -> Result<Artifact, StoreError>;

    /// Flag an artifact as final, optionally attaching its screenshot.
    async fn mark_processed(&self, id: Uuid, screenshot: Option<Vec<u8>>)
        -> Result<(), StoreError>;

    /// Remove an artifact. Unknown ids are ignored.
    async fn delete_artifact(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record a sweep pass that could not finish the artifact.
    async fn touch_artifact(&self, id: Uuid) -> Result<(), StoreError>;

    /// Url scans still waiting for a screenshot, least recently updated first.
    async fn pending_screenshots(&self, limit: i64) -> Result<Vec<Artifact>, StoreError>;
}

/// In-process artifact store for tests and development.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<HashMap<(String, WorkType), Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn find_artifact(
        &self,
        url: &str,
        work_type: WorkType,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(url.to_string(), work_type))
            .cloned())
    }

    async fn save_artifact(&self, mut artifact: Artifact) -> Result<Artifact, StoreError> {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
        let key = (artifact.url.clone(), artifact.work_type);
        if let Some(existing) = artifacts.get(&key) {
            artifact.id = existing.id;
            artifact.created_at = existing.created_at;
            if artifact.screenshot.is_none() {
                artifact.screenshot = existing.screenshot.clone();
            }
            if artifact.caller_ip.is_none() {
                artifact.caller_ip = existing.caller_ip.clone();
            }
        }
        artifact.updated_at = Utc::now();
        artifacts.insert(key, artifact.clone());
        Ok(artifact)
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        screenshot: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
        let artifact = artifacts
            .values_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("artifact {}", id)))?;
        artifact.processed = true;
        if screenshot.is_some() {
            artifact.screenshot = screenshot;
        }
        artifact.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<(), StoreError> {
        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, a| a.id != id);
        Ok(())
    }

    async fn touch_artifact(&self, id: Uuid) -> Result<(), StoreError> {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(artifact) = artifacts.values_mut().find(|a| a.id == id) {
            artifact.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn pending_screenshots(&self, limit: i64) -> Result<Vec<Artifact>, StoreError> {
        let artifacts = self.artifacts.read().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<Artifact> = artifacts
            .values()
            .filter(|a| a.work_type == WorkType::UrlScan && a.screenshot.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|a| (a.updated_at, a.created_at));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification() -> ArtifactPayload {
        ArtifactPayload::Classification(Classification {
            site_name: "Example".into(),
            threat_type: "safe".into(),
            description: "example site".into(),
            threat_score: 1,
        })
    }

    #[test]
    fn test_clean_markdown_removes_empty_links() {
        assert_eq!(clean_markdown("see [](). ()[] fake bank [] ()"), "see .  fake bank");
        assert_eq!(clean_markdown("plain text"), "plain text");
    }

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let json = serde_json::to_value(classification()).unwrap();
        assert_eq!(json["kind"], "classification");
        assert_eq!(json["threat_score"], 1);
    }

    #[tokio::test]
    async fn test_save_artifact_upserts_and_keeps_id() {
        let store = MemoryArtifactStore::new();
        let first = store
            .save_artifact(Artifact::new("https://x.test", classification(), false))
            .await
            .unwrap();
        let second = store
            .save_artifact(Artifact::new("https://x.test", classification(), true))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        let found = store
            .find_artifact("https://x.test", WorkType::Classification)
            .await
            .unwrap()
            .unwrap();
        assert!(found.processed);
    }

    #[tokio::test]
    async fn test_pending_screenshots_until_marked_processed() {
        let store = MemoryArtifactStore::new();
        let scan = ArtifactPayload::UrlScan(UrlScanResult {
            scan_id: "abc".into(),
            result: None,
            screenshot_url: None,
        });
        let saved = store
            .save_artifact(Artifact::new("https://x.test", scan, false))
            .await
            .unwrap();

        assert_eq!(store.pending_screenshots(10).await.unwrap().len(), 1);

        store
            .mark_processed(saved.id, Some(vec![0x89, 0x50]))
            .await
            .unwrap();

        assert!(store.pending_screenshots(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touched_scan_moves_to_the_back() {
        let store = MemoryArtifactStore::new();
        let mut ids = Vec::new();
        for url in ["https://a.test", "https://b.test"] {
            let scan = ArtifactPayload::UrlScan(UrlScanResult {
                scan_id: url.into(),
                result: None,
                screenshot_url: None,
            });
            let saved = store.save_artifact(Artifact::new(url, scan, false)).await.unwrap();
            ids.push(saved.id);
        }
        let first = store.pending_screenshots(1).await.unwrap()[0].id;
        let second = ids.into_iter().find(|id| *id != first).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.touch_artifact(first).await.unwrap();

        assert_eq!(store.pending_screenshots(1).await.unwrap()[0].id, second);
    }

    #[tokio::test]
    async fn test_delete_artifact() {
        let store = MemoryArtifactStore::new();
        let saved = store
            .save_artifact(Artifact::new("https://x.test", classification(), true))
            .await
            .unwrap();

        store.delete_artifact(saved.id).await.unwrap();
        store.delete_artifact(saved.id).await.unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_mark_processed_unknown_id() {
        let store = MemoryArtifactStore::new();
        let err = store.mark_processed(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
