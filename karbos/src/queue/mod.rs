//! Dual-lane job queue and worker-liveness registry.
//!
//! Two lanes share one broker: an *immediate* first-in-first-out lane that
//! workers drain, and a *delayed* lane ordered by scheduled start. The
//! promoter moves due-delayed entries into the immediate lane.
//!
//! Delivery semantics:
//! - The immediate lane is exactly-once across concurrent dequeuers: the
//!   broker's atomic pop guarantees no entry is returned twice.
//! - The delayed lane is at-least-once: `scan_due` may return the same
//!   entry until `remove_from_delayed` succeeds. Downstream idempotence is
//!   the worker pool's job (the Running-transition guard).

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Broker key of the immediate FIFO lane.
pub const IMMEDIATE_QUEUE_KEY: &str = "karbos:queue:immediate";

/// Broker key of the delayed sorted-set lane.
pub const DELAYED_SET_KEY: &str = "karbos:queue:delayed";

/// Prefix of worker-liveness keys (`worker:<uuid>`).
pub const WORKER_KEY_PREFIX: &str = "worker:";

/// Upper bound on entries inspected when removing from the delayed lane.
pub const MAX_REMOVE_SCAN: usize = 1024;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode queue entry: {0}")]
    Encode(String),
    #[error("entry for job {0} not found in delayed lane")]
    EntryNotFound(Uuid),
}

impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Encode(err.to_string())
    }
}

/// An entry in either queue lane, serialized as an opaque JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub docker_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Delayed-lane ordering key, interpreted as an epoch-second score.
    pub scheduled_time: DateTime<Utc>,
    /// Reserved; always zero in this version.
    pub priority: i32,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, docker_image: impl Into<String>, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            job_id,
            docker_image: docker_image.into(),
            command: None,
            scheduled_time,
            priority: 0,
        }
    }

    /// Epoch-second score used by the delayed lane.
    pub fn score(&self) -> i64 {
        self.scheduled_time.timestamp()
    }
}

/// Delayed-lane statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DelayedStats {
    pub total_delayed: i64,
    pub due_now: i64,
    pub pending: i64,
}

/// Capability set for the broker.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends to the tail of the immediate lane. The write is atomic from
    /// a reader's perspective: a partially visible entry is never returned
    /// by [`dequeue_immediate`](Self::dequeue_immediate).
    async fn enqueue_immediate(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Removes and returns the head of the immediate lane, or `None` when
    /// the lane is empty. Non-blocking; never returns the same entry to
    /// two callers.
    async fn dequeue_immediate(&self) -> Result<Option<QueueEntry>, QueueError>;

    /// Inserts into the delayed lane scored by the entry's scheduled start.
    async fn enqueue_delayed(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// All delayed entries with score ≤ `now`, ordered by score ascending.
    /// May return the same entry across calls until it is removed.
    async fn scan_due(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>, QueueError>;

    /// Removes a delayed entry by job id. The member scan is bounded by
    /// [`MAX_REMOVE_SCAN`].
    async fn remove_from_delayed(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Number of entries waiting in the immediate lane.
    async fn immediate_depth(&self) -> Result<i64, QueueError>;

    /// Number of entries parked in the delayed lane.
    async fn delayed_depth(&self) -> Result<i64, QueueError>;

    /// Aggregate delayed-lane statistics.
    async fn delayed_stats(&self) -> Result<DelayedStats, QueueError> {
        let total_delayed = self.delayed_depth().await?;
        let due_now = self.scan_due(Utc::now()).await?.len() as i64;
        Ok(DelayedStats {
            total_delayed,
            due_now,
            pending: total_delayed - due_now,
        })
    }

    /// Writes a liveness sentinel for a worker with the given TTL.
    async fn set_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError>;

    /// Worker ids with a live sentinel.
    async fn list_active_workers(&self) -> Result<Vec<String>, QueueError>;

    /// Broker health check.
    async fn ping(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_score_is_the_scheduled_epoch_second() {
        let at: DateTime<Utc> = "2025-12-04T17:00:00Z".parse().unwrap();
        let entry = QueueEntry::new(Uuid::new_v4(), "alpine:latest", at);
        assert_eq!(entry.score(), at.timestamp());
    }

    #[test]
    fn entry_round_trips_through_json() {
        let entry = QueueEntry {
            job_id: Uuid::new_v4(),
            docker_image: "alpine:latest".to_string(),
            command: Some(vec!["echo".to_string(), "hi".to_string()]),
            scheduled_time: Utc::now(),
            priority: 0,
        };

        let blob = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&blob).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn absent_command_is_omitted_from_the_blob() {
        let entry = QueueEntry::new(Uuid::new_v4(), "alpine:latest", Utc::now());
        let blob = serde_json::to_string(&entry).unwrap();
        assert!(!blob.contains("command"));
    }
}
