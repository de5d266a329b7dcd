// ServerKernel - core infrastructure with all dependencies
//
// Holds the stores, backends and transports the orchestration core runs
// against, each behind a trait so tests can swap in memory implementations.

use std::sync::Arc;

use super::jobs::{ArtifactStore, DedupLock, JobStore, TaskQueue};
use super::traits::{Analyzer, KeyValueStore, NotificationTransport, Scanner};
use crate::config::OrchestratorConfig;
use crate::status::{Broadcaster, StatusCache};

pub struct ServerKernel {
    pub job_store: Arc<dyn JobStore>,
    pub artifact_store: Arc<dyn ArtifactStore>,
    /// Backs the dedup locks and the status cache
    pub kv: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn NotificationTransport>,
    pub analyzer: Arc<dyn Analyzer>,
    pub scanner: Arc<dyn Scanner>,
    pub task_queue: Arc<dyn TaskQueue>,
    pub config: OrchestratorConfig,
}

impl ServerKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_store: Arc<dyn JobStore>,
        artifact_store: Arc<dyn ArtifactStore>,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<dyn NotificationTransport>,
        analyzer: Arc<dyn Analyzer>,
        scanner: Arc<dyn Scanner>,
        task_queue: Arc<dyn TaskQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            job_store,
            artifact_store,
            kv,
            transport,
            analyzer,
            scanner,
            task_queue,
            config,
        }
    }

    pub fn lock(&self) -> DedupLock {
        DedupLock::new(self.kv.clone())
    }

    pub fn status_cache(&self) -> StatusCache {
        StatusCache::new(self.kv.clone(), self.config.status_ttl)
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.status_cache(), self.transport.clone())
    }
}
