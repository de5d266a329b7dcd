use std::time::Duration;

use super::record::WorkType;

/// Bounded exponential backoff for one work type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 6;

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn for_work_type(work_type: WorkType) -> Self {
        match work_type {
            WorkType::Classification => Self::new(Duration::from_secs(4), Duration::from_secs(120)),
            WorkType::Report => Self::new(Duration::from_secs(4), Duration::from_secs(180)),
            WorkType::UrlScan => Self::new(Duration::from_secs(5), Duration::from_secs(180)),
        }
    }

    /// Delay before re-running after `attempt` (0-based) failed: `min(cap, base * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether a transient failure of `attempt` (0-based) may be retried.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
