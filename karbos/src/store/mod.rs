//! Durable job store.
//!
//! The store is the single owner of job rows and execution records: every
//! writer funnels through [`JobStore`]. Status transitions are validated
//! against the lifecycle graph with a conditional update, so concurrent
//! promoters or dequeuers race safely: the loser receives
//! [`StoreError::TransitionRejected`] and moves on.

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use crate::job::{ExecutionRecord, Job, JobStatus};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("transition of job {id} to {to} rejected")]
    TransitionRejected { id: Uuid, to: JobStatus },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// True when the failure means "someone else already handled this job",
    /// as opposed to an infrastructure problem.
    pub fn is_transition_rejected(&self) -> bool {
        matches!(self, StoreError::TransitionRejected { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Capability set for the durable job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job atomically, returning the stored row.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Fetches a job by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Transitions a job's status, refusing moves the lifecycle graph does
    /// not permit. Entering `Running` stamps `started_at`; entering a
    /// terminal state stamps `completed_at`.
    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    /// Jobs with the given status, newest first.
    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Jobs submitted by the given user, newest first.
    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// All jobs, newest first.
    async fn list_all(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Writes a terminal execution record. The worker pool is the only
    /// caller; records are never mutated afterwards.
    async fn write_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
}
