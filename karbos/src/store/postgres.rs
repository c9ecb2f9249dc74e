//! Postgres-backed job store over the shared `jobs` and `execution_logs`
//! tables.
//!
//! Status transitions use a single-row conditional update guarded by the
//! set of allowed predecessor statuses, which serializes racing writers at
//! the store: exactly one concurrent `update_status(id, Running)` wins.

use super::{JobStore, StoreError};
use crate::job::{ExecutionRecord, Job, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    user_id: String,
    docker_image: String,
    command: Option<String>,
    status: String,
    scheduled_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    deadline: DateTime<Utc>,
    estimated_duration: Option<i64>,
    region: Option<String>,
    metadata: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Query(format!("unknown job status '{}'", self.status)))?;

        let command = match self.command {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Query(format!("invalid command payload: {}", e)))?,
            ),
            None => None,
        };

        Ok(Job {
            id: self.id,
            user_id: self.user_id,
            docker_image: self.docker_image,
            command,
            status,
            scheduled_time: self.scheduled_time,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            deadline: self.deadline,
            estimated_duration: self.estimated_duration,
            region: self.region,
            metadata: self.metadata,
        })
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, user_id, docker_image, command, status, scheduled_time,
           created_at, started_at, completed_at, deadline,
           estimated_duration, region, metadata
    FROM jobs
"#;

/// Postgres [`JobStore`] implementation.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn encode_command(command: &Option<Vec<String>>) -> Result<Option<String>, StoreError> {
        command
            .as_ref()
            .map(|argv| {
                serde_json::to_string(argv)
                    .map_err(|e| StoreError::Query(format!("failed to encode command: {}", e)))
            })
            .transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let command = Self::encode_command(&job.command)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, user_id, docker_image, command, status, scheduled_time,
                deadline, estimated_duration, region, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(&job.docker_image)
        .bind(command)
        .bind(job.status.as_str())
        .bind(job.scheduled_time)
        .bind(job.deadline)
        .bind(job.estimated_duration)
        .bind(&job.region)
        .bind(&job.metadata)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE id = $1", SELECT_JOB))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id))?.into_job()
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let allowed: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        if allowed.is_empty() {
            return Err(StoreError::TransitionRejected { id, to: status });
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                started_at = CASE WHEN $1 = 'RUNNING' THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $1 IN ('COMPLETED', 'FAILED') THEN NOW() ELSE completed_at END
            WHERE id = $2 AND status = ANY($3)
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a lost transition race.
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(_) => Err(StoreError::TransitionRejected { id, to: status }),
                None => Err(StoreError::NotFound(id)),
            };
        }

        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{} WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_JOB
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_JOB
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_all(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{} ORDER BY created_at DESC LIMIT $1",
            SELECT_JOB
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn write_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (
                id, job_id, output, error_output, exit_code, duration,
                started_at, completed_at, worker_node_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.job_id)
        .bind(&record.output)
        .bind(&record.error_output)
        .bind(record.exit_code)
        .bind(record.duration)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.worker_node_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
