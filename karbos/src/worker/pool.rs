//! Worker pool: a fixed set of consumers draining the immediate lane.
//!
//! The pool owns its consumers and the shared [`PoolState`]; consumers
//! reference the store, the broker, and the executor by capability, and
//! see the pool only through the read-only "am I draining?" query plus the
//! active-set bookkeeping.
//!
//! # Graceful shutdown
//!
//! [`WorkerPool::stop`] flips the draining flag (no consumer dequeues new
//! work), waits for the active set to empty, then cancels the poll loops.
//! The caller bounds the wait with the operator's grace window; in-flight
//! containers that outlive it are cancelled through the shutdown token.

use super::consumer::Consumer;
use crate::executor::{ContainerExecutor, ResourceLimits};
use crate::queue::JobQueue;
use crate::store::JobStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Default number of consumers.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default idle-poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default per-job execution deadline.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent consumers.
    pub size: usize,
    /// How long an idle consumer sleeps between polls.
    pub poll_interval: Duration,
    /// Per-job execution deadline.
    pub job_timeout: Duration,
    /// Resource ceiling applied to every container.
    pub limits: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            limits: ResourceLimits::default(),
        }
    }
}

/// State shared between the pool and its consumers.
///
/// The active set is keyed by job id only; it never owns the job.
pub(crate) struct PoolState {
    draining: AtomicBool,
    active: DashMap<Uuid, ()>,
    drained: Notify,
}

impl PoolState {
    fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            active: DashMap::new(),
            drained: Notify::new(),
        }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn track_start(&self, job_id: Uuid) {
        self.active.insert(job_id, ());
        debug!(job_id = %job_id, active = self.active.len(), "job tracked as in-flight");
    }

    pub(crate) fn track_complete(&self, job_id: Uuid) {
        self.active.remove(&job_id);
        debug!(job_id = %job_id, active = self.active.len(), "job removed from in-flight set");
        self.drained.notify_waiters();
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Fixed-size pool of queue consumers.
pub struct WorkerPool {
    config: PoolConfig,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn ContainerExecutor>,
    state: Arc<PoolState>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Fresh per-process identity, also used for the liveness beacon.
    process_id: Uuid,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn ContainerExecutor>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            executor,
            state: Arc::new(PoolState::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            process_id: Uuid::new_v4(),
        }
    }

    /// Spawns all consumers. Idempotence is not required: call once.
    pub fn start(&self) {
        info!(size = self.config.size, worker = %self.process_id, "starting worker pool");

        let mut handles = self.handles.lock().unwrap();
        for n in 1..=self.config.size {
            let consumer = Consumer::new(
                format!("worker-{}", n),
                self.process_id.to_string(),
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
                Arc::clone(&self.executor),
                Arc::clone(&self.state),
                self.config.poll_interval,
                self.config.job_timeout,
                self.config.limits,
            );

            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                consumer.run(shutdown).await;
            }));
        }
    }

    /// Drains and stops the pool: no new dequeues, in-flight containers
    /// run to completion, then the poll loops are cancelled.
    ///
    /// The caller bounds this with the operator's grace window, e.g.
    /// `tokio::time::timeout(drain_budget, pool.stop())`.
    pub async fn stop(&self) {
        self.state.draining.store(true, Ordering::SeqCst);

        let active = self.state.active_count();
        if active > 0 {
            info!(active = active, "draining: waiting for running containers to complete");
        }

        while self.state.active_count() > 0 {
            // The timeout re-checks the count in case a notify raced the
            // wait registration.
            let _ = tokio::time::timeout(Duration::from_millis(100), self.state.drained.notified()).await;
        }

        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        info!("worker pool stopped");
    }

    /// Whether the pool has entered draining mode.
    pub fn is_draining(&self) -> bool {
        self.state.is_draining()
    }

    /// Number of jobs currently in flight across all consumers.
    pub fn active_count(&self) -> usize {
        self.state.active_count()
    }

    /// The pool's process identity.
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Token cancelled once drain completes; the worker binary links its
    /// auxiliary daemons (heartbeat, promoter) to it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
