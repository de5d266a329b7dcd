use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::jobs::{RetryPolicy, WorkType};

const MIN_STALE_SECONDS: u64 = 60;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub nats_url: Option<String>,
    pub port: u16,
    pub openai_api_key: String,
    pub openai_model: String,
    pub urlscan_api_key: String,
    pub worker_concurrency: usize,
    pub screenshot_sweep_interval: Duration,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let stale_seconds = parse_secs("REPORT_JOB_STALE_SECONDS", 2700)?.max(MIN_STALE_SECONDS);

        let orchestrator = OrchestratorConfig::default()
            .with_stale_after(Duration::from_secs(stale_seconds))
            .with_lock_ttl(Duration::from_secs(parse_secs("DEDUP_LOCK_TTL_SECONDS", 300)?))
            .with_status_ttl(Duration::from_secs(parse_secs("STATUS_CACHE_TTL_SECONDS", 600)?));

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            nats_url: env::var("NATS_URL").ok().filter(|s| !s.is_empty()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            openai_api_key: env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            urlscan_api_key: env::var("URLSCAN_API_KEY").context("URLSCAN_API_KEY must be set")?,
            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("WORKER_CONCURRENCY must be a valid number")?,
            screenshot_sweep_interval: Duration::from_secs(parse_secs(
                "SCREENSHOT_SWEEP_SECONDS",
                60,
            )?),
            orchestrator,
        })
    }
}

fn parse_secs(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a whole number of seconds", name)),
        Err(_) => Ok(default),
    }
}

/// Tunables shared by the dispatcher, worker and broadcaster.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// In-flight records untouched for longer than this are presumed abandoned
    pub stale_after: Duration,
    pub lock_ttl: Duration,
    pub status_ttl: Duration,
    pub classification_retry: RetryPolicy,
    pub report_retry: RetryPolicy,
    pub url_scan_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(2700),
            lock_ttl: Duration::from_secs(300),
            status_ttl: Duration::from_secs(600),
            classification_retry: RetryPolicy::for_work_type(WorkType::Classification),
            report_retry: RetryPolicy::for_work_type(WorkType::Report),
            url_scan_retry: RetryPolicy::for_work_type(WorkType::UrlScan),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_status_ttl(mut self, status_ttl: Duration) -> Self {
        self.status_ttl = status_ttl;
        self
    }

    pub fn with_retry_policy(mut self, work_type: WorkType, policy: RetryPolicy) -> Self {
        match work_type {
            WorkType::Classification => self.classification_retry = policy,
            WorkType::Report => self.report_retry = policy,
            WorkType::UrlScan => self.url_scan_retry = policy,
        }
        self
    }

    pub fn retry_policy(&self, work_type: WorkType) -> RetryPolicy {
        match work_type {
            WorkType::Classification => self.classification_retry,
            WorkType::Report => self.report_retry,
            WorkType::UrlScan => self.url_scan_retry,
        }
    }

    /// Staleness window as a chrono duration for timestamp arithmetic.
    pub fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.stale_after, Duration::from_secs(2700));
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
        assert_eq!(config.status_ttl, Duration::from_secs(600));
        assert_eq!(config.retry_policy(WorkType::UrlScan).base, Duration::from_secs(5));
        assert_eq!(config.retry_policy(WorkType::Classification).cap, Duration::from_secs(120));
    }

    #[test]
    fn test_with_retry_policy_targets_one_work_type() {
        let fast = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4));
        let config = OrchestratorConfig::default().with_retry_policy(WorkType::Report, fast);

        assert_eq!(config.retry_policy(WorkType::Report), fast);
        assert_eq!(
            config.retry_policy(WorkType::Classification),
            RetryPolicy::for_work_type(WorkType::Classification)
        );
    }
}
