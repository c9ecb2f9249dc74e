//! In-memory job store.
//!
//! Enforces the same lifecycle guarantees as the Postgres store, which is
//! what makes it a faithful test double: transition races lose with
//! `TransitionRejected` here too.

use super::{JobStore, StoreError};
use crate::job::{ExecutionRecord, Job, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// In-memory [`JobStore`] implementation.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All execution records written so far, for test assertions.
    pub fn execution_records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !job.status.can_transition_to(status) {
            return Err(StoreError::TransitionRejected { id, to: status });
        }

        job.status = status;
        match status {
            JobStatus::Running => job.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs.values().filter(|j| j.status == status).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs.values().filter(|j| j.user_id == user_id).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_all(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit.max(0) as usize);
        Ok(all)
    }

    async fn write_execution_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
