//! PostgreSQL-backed job record and artifact storage.
//!
//! The dispatch decision runs inside one transaction: the row is created if
//! absent (`ON CONFLICT DO NOTHING`), then locked with `FOR UPDATE` so
//! concurrent decisions for the same url serialize on it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::artifacts::{Artifact, ArtifactPayload, ArtifactStore};
use super::error::StoreError;
use super::job_store::JobStore;
use super::record::{new_task_id, DispatchPlan, JobRecord, JobStatus, WorkType};

/// Job and artifact storage on a shared connection pool.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Update a record owned by `task_id`. Returns whether a row matched.
    async fn update_task(
        &self,
        sql: &str,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: Option<&str>,
        result_ref: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(sql)
            .bind(url)
            .bind(work_type)
            .bind(task_id)
            .bind(message.unwrap_or_default())
            .bind(result_ref)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn find(&self, url: &str, work_type: WorkType) -> Result<Option<JobRecord>, StoreError> {
        let record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM job_records WHERE url = $1 AND work_type = $2",
        )
        .bind(url)
        .bind(work_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn plan_dispatch(
        &self,
        url: &str,
        work_type: WorkType,
        caller_ip: Option<&str>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<(DispatchPlan, JobRecord), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO job_records (id, url, work_type, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (url, work_type) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(url)
        .bind(work_type)
        .bind(JobStatus::Pending)
        .execute(&mut *tx)
        .await?;

        let mut record = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM job_records WHERE url = $1 AND work_type = $2 FOR UPDATE",
        )
        .bind(url)
        .bind(work_type)
        .fetch_one(&mut *tx)
        .await?;

        let plan = record.plan_dispatch(now, stale_after, new_task_id());

        if let DispatchPlan::Dispatch { .. } = &plan {
            if let Some(ip) = caller_ip {
                record.caller_ip = Some(ip.to_string());
            }
            sqlx::query(
                r#"
                UPDATE job_records
                SET task_id = $1,
                    status = $2,
                    last_error = $3,
                    started_at = $4,
                    finished_at = $5,
                    caller_ip = $6,
                    updated_at = $7
                WHERE id = $8
                "#,
            )
            .bind(&record.task_id)
            .bind(record.status)
            .bind(&record.last_error)
            .bind(record.started_at)
            .bind(record.finished_at)
            .bind(&record.caller_ip)
            .bind(record.updated_at)
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(url, work_type = %work_type, ?plan, "dispatch decision committed");
        Ok((plan, record))
    }

    async fn mark_success_without_run(
        &self,
        url: &str,
        work_type: WorkType,
        result_ref: Option<Uuid>,
    ) -> Result<JobRecord, StoreError> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO job_records (id, url, work_type, status, result_ref, finished_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (url, work_type) DO UPDATE
            SET status = EXCLUDED.status,
                last_error = '',
                result_ref = COALESCE(EXCLUDED.result_ref, job_records.result_ref),
                finished_at = COALESCE(job_records.finished_at, NOW()),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(url)
        .bind(work_type)
        .bind(JobStatus::Success)
        .bind(result_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn claim(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job_records
            SET status = 'STARTED',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE url = $1
              AND work_type = $2
              AND task_id = $3
              AND status IN ('PENDING', 'STARTED')
            RETURNING *
            "#,
        )
        .bind(url)
        .bind(work_type)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn mark_retrying(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        self.update_task(
            r#"
            UPDATE job_records
            SET status = 'STARTED',
                last_error = $4,
                result_ref = COALESCE($5, result_ref),
                updated_at = NOW()
            WHERE url = $1 AND work_type = $2 AND task_id = $3
            "#,
            url,
            work_type,
            task_id,
            Some(message),
            None,
        )
        .await
    }

    async fn mark_succeeded(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        result_ref: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        self.update_task(
            r#"
            UPDATE job_records
            SET status = 'SUCCESS',
                last_error = $4,
                result_ref = COALESCE($5, result_ref),
                finished_at = NOW(),
                updated_at = NOW()
            WHERE url = $1 AND work_type = $2 AND task_id = $3
            "#,
            url,
            work_type,
            task_id,
            None,
            result_ref,
        )
        .await
    }

    async fn mark_failed(
        &self,
        url: &str,
        work_type: WorkType,
        task_id: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        self.update_task(
            r#"
            UPDATE job_records
            SET status = 'FAILURE',
                last_error = $4,
                result_ref = COALESCE($5, result_ref),
                finished_at = NOW(),
                updated_at = NOW()
            WHERE url = $1 AND work_type = $2 AND task_id = $3
            "#,
            url,
            work_type,
            task_id,
            Some(message),
            None,
        )
        .await
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(FromRow)]
struct ArtifactRow {
    id: Uuid,
    url: String,
    work_type: WorkType,
    processed: bool,
    payload: Json<ArtifactPayload>,
    screenshot: Option<Vec<u8>>,
    caller_ip: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Self {
            id: row.id,
            url: row.url,
            work_type: row.work_type,
            processed: row.processed,
            payload: row.payload.0,
            screenshot: row.screenshot,
            caller_ip: row.caller_ip,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl ArtifactStore for PostgresJobStore {
    async fn find_artifact(
        &self,
        url: &str,
        work_type: WorkType,
    ) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM artifacts WHERE url = $1 AND work_type = $2",
        )
        .bind(url)
        .bind(work_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Artifact::from))
    }

    async fn save_artifact(&self, artifact: Artifact) -> Result<Artifact, StoreError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            INSERT INTO artifacts (id, url, work_type, processed, payload, screenshot, caller_ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (url, work_type) DO UPDATE
            SET processed = EXCLUDED.processed,
                payload = EXCLUDED.payload,
                screenshot = COALESCE(EXCLUDED.screenshot, artifacts.screenshot),
                caller_ip = COALESCE(EXCLUDED.caller_ip, artifacts.caller_ip),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(artifact.id)
        .bind(&artifact.url)
        .bind(artifact.work_type)
        .bind(artifact.processed)
        .bind(Json(&artifact.payload))
        .bind(&artifact.screenshot)
        .bind(&artifact.caller_ip)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        screenshot: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE artifacts
            SET processed = TRUE,
                screenshot = COALESCE($2, screenshot),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(screenshot)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("artifact {}", id)));
        }
        Ok(())
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM artifacts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_artifact(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE artifacts SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_screenshots(&self, limit: i64) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT * FROM artifacts
            WHERE work_type = 'url_scan' AND screenshot IS NULL
            ORDER BY updated_at, created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Artifact::from).collect())
    }
}
