//! Dedup lock: short-lived "someone is already on it" markers.
//!
//! Purely advisory. The unique (url, work type) job record is what guarantees
//! at most one attempt in flight; the lock only avoids redundant submissions.
//! Every KV failure degrades to "not locked" and is left to the TTL.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::record::WorkType;
use crate::common::url_key;
use crate::kernel::traits::KeyValueStore;

/// Lock key for one url and work type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(work_type: WorkType, url: &str) -> Self {
        Self(format!("lock:{}:{}", work_type, url_key(url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct DedupLock {
    kv: Arc<dyn KeyValueStore>,
}

impl DedupLock {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Atomically take the lock. False if another holder is active.
    pub async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> bool {
        match self.kv.add(key.as_str(), "1", ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(key = %key, error = %e, "lock acquire failed, proceeding unlocked");
                true
            }
        }
    }

    pub async fn release(&self, key: &LockKey) {
        if let Err(e) = self.kv.delete(key.as_str()).await {
            warn!(key = %key, error = %e, "lock release failed, leaving it to expire");
        }
    }

    /// Extend the lock for a retry backoff. Re-takes it if it already expired.
    pub async fn refresh(&self, key: &LockKey, ttl: Duration) {
        if let Err(e) = self.kv.set(key.as_str(), "1", ttl).await {
            warn!(key = %key, error = %e, "lock refresh failed");
        }
    }

    pub async fn is_held(&self, key: &LockKey) -> bool {
        matches!(self.kv.get(key.as_str()).await, Ok(Some(_)))
    }
}
