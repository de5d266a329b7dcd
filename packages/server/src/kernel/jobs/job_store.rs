//! Durable job record storage.
//!
//! The decision logic lives on [`JobRecord`]; stores only provide the row lock
//! around it and persist the outcome.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::StoreError;
use super::record::{new_task_id, DispatchPlan, JobRecord, JobStatus, WorkType};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find(&self, url: &str, work_type: WorkType) -> Result<Option<JobRecord>, StoreError>;

    /// Lock (creating if absent) the record for `url` and run the dispatch
    /// decision against it. The returned plan is committed when this returns.
    async fn plan_dispatch(
        &self,
        url: &str,
        work_type: WorkType,
        caller_ip: Option<&str>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<(DispatchPlan, JobRecord), StoreError>;

    /// Upsert the record to SUCCESS when the artifact already exists.
    async fn mark_success_without_run(
        &self,
        url: &str,
        work_type: WorkType,
        result_ref: Option<Uuid>,
    ) -> Result<JobRecord, StoreError>;

    /// PENDING/STARTED -> STARTED for the attempt `task_id`.
    ///
    /// Returns `None` when the record was superseded by another attempt.
    async fn claim(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Keep the record STARTED with an informative error while a retry waits.
    async fn mark_retrying(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError>;

    async fn mark_succeeded(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        result_ref: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    async fn mark_failed(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError>;
}

/// In-process job store for tests and development.
///
/// A single mutex stands in for the row lock.
#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<(String, WorkType), JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record as-is.
    pub fn put(&self, record: JobRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((record.url.clone(), record.work_type), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of PENDING/STARTED records for a url and work type (0 or 1).
    pub fn in_flight_count(&self, url: &str, work_type: WorkType) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.url == url && r.work_type == work_type && !r.status.is_terminal())
            .count()
    }

    /// Apply `update` to the record if it belongs to `task_id`.
    fn update_task<F>(&self, url: &str, work_type: WorkType, task_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&(url.to_string(), work_type)) {
            Some(record) if record.matches_task(task_id) => {
                update(record);
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find(&self, url: &str, work_type: WorkType) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(url.to_string(), work_type))
            .cloned())
    }

    async fn plan_dispatch(
        &self,
        url: &str,
        work_type: WorkType,
        caller_ip: Option<&str>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<(DispatchPlan, JobRecord), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry((url.to_string(), work_type))
            .or_insert_with(|| JobRecord::new(url, work_type));

        let plan = record.plan_dispatch(now, stale_after, new_task_id());
        if matches!(plan, DispatchPlan::Dispatch { .. }) {
            if let Some(ip) = caller_ip {
                record.caller_ip = Some(ip.to_string());
            }
        }
        Ok((plan, record.clone()))
    }

    async fn mark_success_without_run(
        &self,
        url: &str,
        work_type: WorkType,
        result_ref: Option<Uuid>,
    ) -> Result<JobRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry((url.to_string(), work_type))
            .or_insert_with(|| JobRecord::new(url, work_type));
        record.mark_success_without_run(result_ref, Utc::now());
        Ok(record.clone())
    }

    async fn claim(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&(url.to_string(), work_type)) {
            Some(record) if record.matches_task(task_id) && !record.status.is_terminal() => {
                let now = Utc::now();
                record.status = JobStatus::Started;
                record.started_at.get_or_insert(now);
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_retrying(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.update_task(url, work_type, task_id, |record| {
            record.status = JobStatus::Started;
            record.last_error = message.to_string();
        }))
    }

    async fn mark_succeeded(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        result_ref: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        Ok(self.update_task(url, work_type, task_id, |record| {
            record.status = JobStatus::Success;
            record.last_error.clear();
            record.finished_at = Some(Utc::now());
            if result_ref.is_some() {
                record.result_ref = result_ref;
            }
        }))
    }

    async fn mark_failed(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.update_task(url, work_type, task_id, |record| {
            record.status = JobStatus::Failure;
            record.last_error = message.to_string();
            record.finished_at = Some(Utc::now());
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://x.test";

    fn window() -> Duration {
        Duration::seconds(2700)
    }

    #[tokio::test]
    async fn test_plan_dispatch_then_attach() {
        let store = MemoryJobStore::new();

        let (first, record) = store
            .plan_dispatch(URL, WorkType::Report, Some("10.0.0.1"), Utc::now(), window())
            .await
            .unwrap();
        let (second, same) = store
            .plan_dispatch(URL, WorkType::Report, None, Utc::now(), window())
            .await
            .unwrap();

        assert!(matches!(first, DispatchPlan::Dispatch { .. }));
        assert_eq!(second, DispatchPlan::Attach);
        assert_eq!(record.task_id, same.task_id);
        assert_eq!(same.caller_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(store.in_flight_count(URL, WorkType::Report), 1);
    }

    #[tokio::test]
    async fn test_work_types_are_independent() {
        let store = MemoryJobStore::new();
        for work_type in WorkType::ALL {
            let (plan, _) = store
                .plan_dispatch(URL, work_type, None, Utc::now(), window())
                .await
                .unwrap();
            assert!(matches!(plan, DispatchPlan::Dispatch { .. }));
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_claim_rejects_superseded_task() {
        let store = MemoryJobStore::new();
        let (_, record) = store
            .plan_dispatch(URL, WorkType::Report, None, Utc::now(), window())
            .await
            .unwrap();
        let task_id = record.task_id.clone().unwrap();

        assert!(store.claim(URL, WorkType::Report, "other").await.unwrap().is_none());

        let claimed = store
            .claim(URL, WorkType::Report, &task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Started);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_transitions_only_apply_to_current_task() {
        let store = MemoryJobStore::new();
        let (_, record) = store
            .plan_dispatch(URL, WorkType::Report, None, Utc::now(), window())
            .await
            .unwrap();
        let task_id = record.task_id.clone().unwrap();

        assert!(!store
            .mark_failed(URL, WorkType::Report, "stale-worker", "late")
            .await
            .unwrap());
        assert!(store
            .mark_failed(URL, WorkType::Report, &task_id, "boom")
            .await
            .unwrap());

        let record = store.find(URL, WorkType::Report).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failure);
        assert_eq!(record.last_error, "boom");
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_success_without_run_creates_record() {
        let store = MemoryJobStore::new();
        let artifact_id = Uuid::new_v4();

        let record = store
            .mark_success_without_run(URL, WorkType::Classification, Some(artifact_id))
            .await
            .unwrap();

        assert_eq!(record.status, JobStatus::Success);
        assert_eq!(record.result_ref, Some(artifact_id));
        assert!(record.task_id.is_none());
    }
}
