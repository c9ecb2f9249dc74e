//! Delayed-job promoter daemon.
//!
//! On every tick the promoter scans the delayed lane for entries whose
//! scheduled start has arrived and moves them into the immediate lane.
//! The order of operations is enqueue first, remove second:
//!
//! - enqueue fails → the remove is not attempted; the entry stays due and
//!   is retried next tick (at-least-once promotion).
//! - remove fails → the entry may be promoted twice; the worker's
//!   Running-transition guard makes the duplicate a no-op.
//!
//! The promoter is the only writer into the immediate lane aside from the
//! scheduler's initial enqueue, and it never runs containers itself.

use crate::queue::{DelayedStats, JobQueue, QueueEntry, QueueError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default promotion check interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Promoter status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PromoterStatus {
    pub check_interval_secs: u64,
    pub delayed: DelayedStats,
}

/// Background daemon that promotes due-delayed jobs.
pub struct Promoter {
    queue: Arc<dyn JobQueue>,
    check_interval: Duration,
}

impl Promoter {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Sets a custom check interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Runs the promotion loop until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "promoter starting"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        // The first tick fires immediately; skip it so a freshly started
        // promoter does not race its own wiring.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("promoter shutting down");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(err) = self.promote_due().await {
                        warn!(error = %err, "promotion pass failed");
                    }
                }
            }
        }
    }

    /// One promotion pass: scan due entries, promote each.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let due = self.queue.scan_due(Utc::now()).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "found jobs ready for promotion");

        let mut promoted = 0;
        for entry in due {
            match self.promote(&entry).await {
                Ok(()) => promoted += 1,
                Err(err) => {
                    warn!(job_id = %entry.job_id, error = %err, "failed to promote job");
                }
            }
        }

        if promoted > 0 {
            info!(promoted = promoted, "promoted delayed jobs to immediate lane");
        }
        Ok(promoted)
    }

    /// Moves one entry. Enqueue must succeed before the remove is tried.
    async fn promote(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.queue.enqueue_immediate(entry).await?;

        if let Err(err) = self.queue.remove_from_delayed(entry.job_id).await {
            // The entry is already visible in the immediate lane; a failed
            // remove only risks a duplicate, which the worker tolerates.
            warn!(job_id = %entry.job_id, error = %err, "failed to remove promoted entry from delayed lane");
        }

        debug!(job_id = %entry.job_id, "promoted job");
        Ok(())
    }

    /// Current delayed-lane statistics for observability surfaces.
    pub async fn status(&self) -> Result<PromoterStatus, QueueError> {
        Ok(PromoterStatus {
            check_interval_secs: self.check_interval.as_secs(),
            delayed: self.queue.delayed_stats().await?,
        })
    }
}
