//! Worker liveness beacon.
//!
//! Each worker process writes a `worker:<uuid>` sentinel into the broker
//! every period with a TTL slightly longer than the period, so a crashed
//! or partitioned worker disappears from the registry within one TTL.

use crate::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default beacon period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

/// Default sentinel TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Background daemon refreshing one worker's liveness sentinel.
pub struct Heartbeat {
    queue: Arc<dyn JobQueue>,
    worker_id: String,
    period: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(queue: Arc<dyn JobQueue>, worker_id: impl Into<String>) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            period: DEFAULT_PERIOD,
            ttl: DEFAULT_TTL,
        }
    }

    /// Overrides the beacon period and TTL together; the TTL should stay
    /// longer than the period.
    pub fn with_timing(mut self, period: Duration, ttl: Duration) -> Self {
        self.period = period;
        self.ttl = ttl;
        self
    }

    /// Runs the beacon loop until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.worker_id, period_secs = self.period.as_secs(), "heartbeat starting");

        // Initial beacon so the worker is visible before the first period
        // elapses.
        self.beat().await;

        let mut interval = tokio::time::interval(self.period);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(worker = %self.worker_id, "heartbeat stopped");
                    break;
                }

                _ = interval.tick() => {
                    self.beat().await;
                }
            }
        }
    }

    async fn beat(&self) {
        match self.queue.set_heartbeat(&self.worker_id, self.ttl).await {
            Ok(()) => debug!(worker = %self.worker_id, "heartbeat sent"),
            Err(err) => warn!(worker = %self.worker_id, error = %err, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn worker_is_visible_immediately_and_expires_after_ttl() {
        let queue = Arc::new(MemoryQueue::new());
        let heartbeat = Heartbeat::new(queue.clone() as Arc<dyn JobQueue>, "w-1")
            .with_timing(Duration::from_secs(60), Duration::from_millis(80));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(heartbeat.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.list_active_workers().await.unwrap(), vec!["w-1".to_string()]);

        // Stop refreshing; the sentinel lapses after its TTL.
        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.list_active_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn beacon_refreshes_within_the_period() {
        let queue = Arc::new(MemoryQueue::new());
        let heartbeat = Heartbeat::new(queue.clone() as Arc<dyn JobQueue>, "w-2")
            .with_timing(Duration::from_millis(30), Duration::from_millis(50));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(heartbeat.run(shutdown.clone()));

        // Several TTLs later the worker is still visible because the
        // beacon keeps refreshing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.list_active_workers().await.unwrap().len(), 1);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
