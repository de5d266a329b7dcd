//! In-process key-value store with per-entry expiry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::traits::KeyValueStore;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Memory-backed [`KeyValueStore`] for tests and single-process development.
///
/// Uses tokio's clock so paused-time tests can expire entries.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Remaining time to live for `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_is_set_if_absent() {
        let kv = MemoryKeyValueStore::new();
        assert!(kv.add("k", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.add("k", "2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let kv = MemoryKeyValueStore::new();
        kv.set("k", "v", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.add("k", "again", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_extends_live_key_only() {
        let kv = MemoryKeyValueStore::new();
        kv.set("k", "v", Duration::from_secs(5)).await.unwrap();

        assert!(kv.expire("k", Duration::from_secs(300)).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(kv.contains("k"));

        assert!(!kv.expire("missing", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let kv = MemoryKeyValueStore::new();
        kv.set("k", "v", Duration::from_secs(60)).await.unwrap();
        kv.delete("k").await.unwrap();
        assert!(!kv.contains("k"));
    }
}
