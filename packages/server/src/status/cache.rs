//! Last-known status per url, stored as JSON in the key-value service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use super::snapshot::StatusSnapshot;
use crate::common::url_key;
use crate::kernel::traits::KeyValueStore;

pub fn status_key(url: &str) -> String {
    format!("status:{}", url_key(url))
}

#[derive(Clone)]
pub struct StatusCache {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn get(&self, url: &str) -> Result<Option<StatusSnapshot>> {
        let Some(raw) = self.kv.get(&status_key(url)).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&raw).context("corrupt status snapshot")?;
        Ok(Some(snapshot))
    }

    /// Overlay `update` on the stored snapshot and store the result with a fresh TTL.
    ///
    /// Not atomic across processes. Concurrent merges of disjoint fields can
    /// lose one side until the next update for that url.
    pub async fn merge(&self, url: &str, update: &StatusSnapshot) -> Result<StatusSnapshot> {
        let key = status_key(url);
        let mut snapshot = match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(url, error = %e, "discarding corrupt status snapshot");
                StatusSnapshot::new(url)
            }),
            None => StatusSnapshot::new(url),
        };
        snapshot.merge(update);

        let raw = serde_json::to_string(&snapshot)?;
        self.kv.set(&key, &raw, self.ttl).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Field;
    use crate::kernel::jobs::{JobStatus, WorkType};
    use crate::kernel::MemoryKeyValueStore;

    const URL: &str = "https://x.test";

    fn cache() -> (StatusCache, Arc<MemoryKeyValueStore>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        (StatusCache::new(kv.clone(), Duration::from_secs(600)), kv)
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_none() {
        let (cache, _) = cache();
        assert!(cache.get(URL).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_accumulates_fields() {
        let (cache, kv) = cache();

        let mut first = StatusSnapshot::new(URL);
        first.site_name = Field::Value("Example".into());
        cache.merge(URL, &first).await.unwrap();

        let second = StatusSnapshot::job_progress(URL, WorkType::Report, JobStatus::Started);
        let merged = cache.merge(URL, &second).await.unwrap();

        assert_eq!(merged.site_name, Field::Value("Example".into()));
        assert_eq!(merged.report_job_status, Field::Value(JobStatus::Started));
        assert_eq!(cache.get(URL).await.unwrap(), Some(merged));
        assert_eq!(kv.ttl(&status_key(URL)), Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_replaced() {
        let (cache, kv) = cache();
        kv.set(&status_key(URL), "not json", Duration::from_secs(60))
            .await
            .unwrap();

        let update = StatusSnapshot::job_progress(URL, WorkType::UrlScan, JobStatus::Pending);
        let merged = cache.merge(URL, &update).await.unwrap();

        assert_eq!(merged.screenshot_job_status, Field::Value(JobStatus::Pending));
    }
}
