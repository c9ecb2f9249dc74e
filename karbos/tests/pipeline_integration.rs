//! End-to-end pipeline tests on in-memory collaborators.
//!
//! Drives the full submission path: submit → schedule → enqueue →
//! promote → dequeue → execute → record, with a stub container executor
//! standing in for Docker.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use karbos::carbon::IntensitySample;
use karbos::executor::{combine_output, ContainerExecutor, ExecutionResult, ExecutorError, ResourceLimits};
use karbos::job::JobStatus;
use karbos::queue::{JobQueue, MemoryQueue, QueueEntry};
use karbos::scheduler::{CarbonScheduler, ForecastSource};
use karbos::service::{JobService, SubmitRequest};
use karbos::store::{JobStore, MemoryJobStore};
use karbos::worker::{PoolConfig, Promoter, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Hourly intensity curve anchored at the time of the request.
struct Curve(Vec<f64>);

#[async_trait]
impl ForecastSource for Curve {
    async fn forecast(&self, region: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<IntensitySample> {
        self.0
            .iter()
            .enumerate()
            .map(|(i, v)| IntensitySample::live(region, start + ChronoDuration::hours(i as i64), *v))
            .filter(|s| s.instant <= end)
            .collect()
    }

    async fn current(&self, region: &str) -> IntensitySample {
        IntensitySample::live(region, Utc::now(), self.0.first().copied().unwrap_or(0.0))
    }
}

/// Container runtime stub: runs for a fixed delay, exits zero.
struct StubExecutor {
    delay: Duration,
}

#[async_trait]
impl ContainerExecutor for StubExecutor {
    async fn ensure_image(&self, _image: &str) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn run(
        &self,
        _image: &str,
        _command: Option<&[String]>,
        _limits: &ResourceLimits,
        _deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started_at = Utc::now();
        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecutorError::Canceled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        Ok(ExecutionResult {
            exit_code: 0,
            output: combine_output("done\n", ""),
            runtime_secs: self.delay.as_secs() as i64,
            started_at,
        })
    }

    async fn ping(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
    service: JobService,
    pool: WorkerPool,
}

fn harness(curve: Vec<f64>) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let source = Arc::new(Curve(curve));

    let service = JobService::new(
        store.clone() as Arc<dyn JobStore>,
        queue.clone() as Arc<dyn JobQueue>,
        CarbonScheduler::new(source.clone() as Arc<dyn ForecastSource>),
        source as Arc<dyn ForecastSource>,
    );

    let pool = WorkerPool::new(
        PoolConfig {
            size: 2,
            poll_interval: Duration::from_millis(10),
            job_timeout: Duration::from_secs(5),
            limits: ResourceLimits::default(),
        },
        queue.clone() as Arc<dyn JobQueue>,
        store.clone() as Arc<dyn JobStore>,
        Arc::new(StubExecutor {
            delay: Duration::from_millis(30),
        }),
    );

    Harness { store, queue, service, pool }
}

fn submit_request(duration_secs: i64) -> SubmitRequest {
    SubmitRequest {
        user_id: "alice".to_string(),
        docker_image: "alpine:latest".to_string(),
        command: Some(vec!["echo".to_string(), "hi".to_string()]),
        deadline: (Utc::now() + ChronoDuration::hours(6)).to_rfc3339_opts(SecondsFormat::Secs, true),
        estimated_duration: Some(duration_secs),
        region: None,
    }
}

async fn wait_for_status(store: &MemoryJobStore, id: Uuid, status: JobStatus) {
    for _ in 0..300 {
        if store.get_by_id(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached {:?}", status);
}

#[tokio::test]
async fn immediate_submission_runs_to_completion() {
    // Clean grid: everything under the threshold goes straight through.
    let h = harness(vec![300.0; 6]);
    h.pool.start();

    let response = h.service.submit(&submit_request(60), false).await.unwrap();
    assert!(response.immediate);

    wait_for_status(&h.store, response.id, JobStatus::Completed).await;
    h.pool.stop().await;

    let records = h.store.execution_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].exit_code, Some(0));
    assert_eq!(records[0].job_id, response.id);
}

#[tokio::test]
async fn delayed_submission_promotes_then_completes() {
    // Dirty grid now, clean later: the job parks in the delayed lane. A
    // promoter with the clock effectively "arrived" at the scheduled time
    // moves it over and the pool drains it.
    let h = harness(vec![450.0, 410.0, 370.0, 260.0, 290.0, 320.0]);

    let response = h.service.submit(&submit_request(3600), false).await.unwrap();
    assert!(!response.immediate);
    assert_eq!(h.queue.delayed_depth().await.unwrap(), 1);

    let stored = h.store.get_by_id(response.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Delayed);

    // Simulate the scheduled time arriving: scan with a "now" past the
    // scheduled start and promote exactly as a later tick would.
    let scheduled = stored.scheduled_time.unwrap();
    let due = h.queue.scan_due(scheduled + ChronoDuration::seconds(1)).await.unwrap();
    assert_eq!(due.len(), 1);
    for entry in &due {
        h.queue.enqueue_immediate(entry).await.unwrap();
        h.queue.remove_from_delayed(entry.job_id).await.unwrap();
    }

    h.pool.start();
    wait_for_status(&h.store, response.id, JobStatus::Completed).await;
    h.pool.stop().await;

    let done = h.store.get_by_id(response.id).await.unwrap();
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert_eq!(h.store.execution_records().len(), 1);
}

#[tokio::test]
async fn promoter_daemon_moves_past_due_entries_into_the_immediate_lane() {
    let h = harness(vec![300.0; 4]);

    // A delayed entry whose scheduled start is already in the past, as
    // after a promoter outage.
    let job = h
        .store
        .create(karbos::job::Job::new(
            "alice",
            "alpine:latest",
            Utc::now() + ChronoDuration::hours(1),
        ))
        .await
        .unwrap();
    h.store.update_status(job.id, JobStatus::Delayed).await.unwrap();
    h.queue
        .enqueue_delayed(&QueueEntry::new(
            job.id,
            "alpine:latest",
            Utc::now() - ChronoDuration::seconds(30),
        ))
        .await
        .unwrap();

    let promoter =
        Promoter::new(h.queue.clone() as Arc<dyn JobQueue>).with_check_interval(Duration::from_millis(20));
    let shutdown = CancellationToken::new();
    let promoter_handle = tokio::spawn(promoter.run(shutdown.clone()));

    h.pool.start();
    wait_for_status(&h.store, job.id, JobStatus::Completed).await;

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), promoter_handle).await;
    h.pool.stop().await;

    assert_eq!(h.queue.delayed_depth().await.unwrap(), 0);
    assert_eq!(h.queue.immediate_depth().await.unwrap(), 0);
    assert_eq!(h.store.execution_records().len(), 1);
}

#[tokio::test]
async fn duplicate_promotion_executes_the_container_once() {
    let h = harness(vec![300.0; 4]);

    let job = h
        .store
        .create(karbos::job::Job::new(
            "alice",
            "alpine:latest",
            Utc::now() + ChronoDuration::hours(1),
        ))
        .await
        .unwrap();

    // The at-least-once failure mode: the same entry lands in the
    // immediate lane twice.
    let entry = QueueEntry::new(job.id, "alpine:latest", Utc::now());
    h.queue.enqueue_immediate(&entry).await.unwrap();
    h.queue.enqueue_immediate(&entry).await.unwrap();

    h.pool.start();
    wait_for_status(&h.store, job.id, JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.pool.stop().await;

    assert_eq!(h.store.execution_records().len(), 1);
}

#[tokio::test]
async fn shutdown_mid_run_still_writes_the_record() {
    let h = harness(vec![300.0; 4]);
    h.pool.start();

    let response = h.service.submit(&submit_request(60), false).await.unwrap();

    // Wait until the container is in flight, then drain.
    for _ in 0..100 {
        if h.pool.active_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.pool.stop().await;

    let done = h.store.get_by_id(response.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(h.store.execution_records().len(), 1);
}
