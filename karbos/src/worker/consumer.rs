//! Queue consumer: one worker's poll-dequeue-execute loop.
//!
//! The loop is idempotence's last line of defense against the delayed
//! lane's at-least-once delivery: claiming a job is a guarded transition
//! to `Running`, so a duplicate dequeue observes either a terminal status
//! (spurious entry) or a rejected transition (another consumer won) and
//! skips without side effects.

use super::pool::PoolState;
use crate::executor::{ContainerExecutor, ExecutionResult, ExecutorError, ResourceLimits};
use crate::job::{ExecutionRecord, Job, JobStatus};
use crate::queue::{JobQueue, QueueEntry, QueueError};
use crate::store::{JobStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single worker loop. Owned and spawned by the pool.
pub(crate) struct Consumer {
    label: String,
    worker_node_id: String,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn ContainerExecutor>,
    state: Arc<PoolState>,
    poll_interval: Duration,
    job_timeout: Duration,
    limits: ResourceLimits,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        label: String,
        worker_node_id: String,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn ContainerExecutor>,
        state: Arc<PoolState>,
        poll_interval: Duration,
        job_timeout: Duration,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            label,
            worker_node_id,
            queue,
            store,
            executor,
            state,
            poll_interval,
            job_timeout,
            limits,
        }
    }

    /// Runs until shutdown is signalled or the pool starts draining.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        debug!(worker = %self.label, "consumer started");

        loop {
            if shutdown.is_cancelled() || self.state.is_draining() {
                break;
            }

            let idle = match self.queue.dequeue_immediate().await {
                Ok(Some(entry)) => {
                    self.handle_entry(entry, &shutdown).await;
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    // Broker hiccup: back off one poll interval and retry.
                    self.log_queue_error(&err);
                    true
                }
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        debug!(worker = %self.label, "consumer stopped");
    }

    /// Claims and executes one dequeued entry.
    async fn handle_entry(&self, entry: QueueEntry, shutdown: &CancellationToken) {
        let job = match self.store.get_by_id(entry.job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                debug!(worker = %self.label, job_id = %entry.job_id, "spurious entry: job not found");
                return;
            }
            Err(err) => {
                warn!(worker = %self.label, job_id = %entry.job_id, error = %err, "failed to fetch job");
                return;
            }
        };

        if job.status.is_terminal() {
            // Duplicate promotion: the job was already handled.
            debug!(worker = %self.label, job_id = %job.id, status = %job.status, "spurious entry: job already terminal");
            return;
        }

        match self.store.update_status(job.id, JobStatus::Running).await {
            Ok(()) => {}
            Err(err) if err.is_transition_rejected() => {
                debug!(worker = %self.label, job_id = %job.id, "another worker claimed the job");
                return;
            }
            Err(err) => {
                warn!(worker = %self.label, job_id = %job.id, error = %err, "failed to claim job");
                return;
            }
        }

        info!(worker = %self.label, job_id = %job.id, image = %job.docker_image, "job running");

        self.state.track_start(job.id);
        self.execute(&job, shutdown).await;
        self.state.track_complete(job.id);
    }

    /// Runs the container and records the outcome. Errors terminate the
    /// job, never the worker.
    async fn execute(&self, job: &Job, shutdown: &CancellationToken) {
        let started_at = Utc::now();
        let outcome = self
            .executor
            .run(
                &job.docker_image,
                job.command.as_deref(),
                &self.limits,
                self.job_timeout,
                shutdown,
            )
            .await;

        let mut record = ExecutionRecord::begin(job.id, &self.worker_node_id, started_at);
        record.completed_at = Some(Utc::now());

        let final_status = match &outcome {
            Ok(result) => {
                record.exit_code = Some(result.exit_code as i32);
                record.duration = Some(result.runtime_secs);
                record.output = Some(result.output.clone());
                record.started_at = result.started_at;

                if result.exit_code == 0 {
                    info!(worker = %self.label, job_id = %job.id, "job completed");
                    JobStatus::Completed
                } else {
                    let message = Self::exit_message(result);
                    warn!(worker = %self.label, job_id = %job.id, exit_code = result.exit_code, "job failed");
                    record.error_output = Some(message);
                    JobStatus::Failed
                }
            }
            Err(err) => {
                warn!(worker = %self.label, job_id = %job.id, error = %err, "job execution failed");
                record.error_output = Some(err.to_string());
                record.duration = Some((Utc::now() - started_at).num_seconds());
                JobStatus::Failed
            }
        };

        // A container that started always leaves an execution record, even
        // when the status write below fails.
        if let Err(err) = self.store.write_execution_record(&record).await {
            warn!(worker = %self.label, job_id = %job.id, error = %err, "failed to write execution record");
        }

        match self.store.update_status(job.id, final_status).await {
            Ok(()) => {}
            Err(err) if err.is_transition_rejected() => {
                warn!(worker = %self.label, job_id = %job.id, "final status transition rejected");
            }
            Err(err) => {
                // Best effort: the job may be left Running (see the
                // reconciliation note in the crate docs).
                warn!(worker = %self.label, job_id = %job.id, error = %err, "failed to write final status");
            }
        }

        if matches!(outcome, Err(ExecutorError::Canceled)) {
            debug!(worker = %self.label, job_id = %job.id, "execution canceled");
        }
    }

    fn exit_message(result: &ExecutionResult) -> String {
        format!("Container exited with code {}", result.exit_code)
    }

    fn log_queue_error(&self, err: &QueueError) {
        warn!(worker = %self.label, error = %err, "dequeue failed, backing off");
    }
}
