//! Redis-backed queue: a list for the immediate lane, a sorted set for the
//! delayed lane, TTL'd keys for worker liveness.
//!
//! All operations map onto native-atomic Redis commands, which is where the
//! exactly-once pop guarantee comes from: `LPOP` removes and returns the
//! head in one step, so concurrent workers can never share an entry.

use super::{
    DelayedStats, JobQueue, QueueEntry, QueueError, DELAYED_SET_KEY, IMMEDIATE_QUEUE_KEY,
    MAX_REMOVE_SCAN, WORKER_KEY_PREFIX,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Redis [`JobQueue`] implementation.
pub struct RedisQueue {
    conn: ConnectionManager,
    immediate_key: String,
    delayed_key: String,
}

impl RedisQueue {
    /// Connects to Redis and verifies the connection with a ping.
    ///
    /// `url` is a standard `redis://[:password@]host:port/db` URL.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        Self::connect_with_keys(url, IMMEDIATE_QUEUE_KEY, DELAYED_SET_KEY).await
    }

    /// Connects with custom lane keys (tests, multi-tenant brokers).
    pub async fn connect_with_keys(
        url: &str,
        immediate_key: impl Into<String>,
        delayed_key: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;

        let queue = Self {
            conn,
            immediate_key: immediate_key.into(),
            delayed_key: delayed_key.into(),
        };
        queue.ping().await?;
        info!("connected to redis broker");

        Ok(queue)
    }

    fn decode(raw: &str) -> Option<QueueEntry> {
        match serde_json::from_str(raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                // A corrupt blob is skipped rather than wedging the lane.
                warn!(error = %err, "failed to decode queue entry, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue_immediate(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let blob = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.immediate_key, blob).await?;
        debug!(job_id = %entry.job_id, "enqueued immediate job");
        Ok(())
    }

    async fn dequeue_immediate(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(&self.immediate_key, None).await?;
        Ok(raw.as_deref().and_then(Self::decode))
    }

    async fn enqueue_delayed(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let blob = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(&self.delayed_key, blob, entry.score() as f64).await?;
        debug!(
            job_id = %entry.job_id,
            scheduled_time = %entry.scheduled_time,
            "enqueued delayed job"
        );
        Ok(())
    }

    async fn scan_due(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .zrangebyscore(&self.delayed_key, "-inf", now.timestamp() as f64)
            .await?;
        Ok(raws.iter().filter_map(|raw| Self::decode(raw)).collect())
    }

    async fn remove_from_delayed(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        // Entries are keyed by their full blob, so removal requires a
        // member scan. The scan is bounded; in practice the delayed lane
        // is far smaller than the bound.
        let raws: Vec<String> = conn
            .zrange(&self.delayed_key, 0, MAX_REMOVE_SCAN as isize - 1)
            .await?;

        for raw in raws {
            if let Some(entry) = Self::decode(&raw) {
                if entry.job_id == job_id {
                    let _: i64 = conn.zrem(&self.delayed_key, raw).await?;
                    debug!(job_id = %job_id, "removed delayed job");
                    return Ok(());
                }
            }
        }

        Err(QueueError::EntryNotFound(job_id))
    }

    async fn immediate_depth(&self) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.immediate_key).await?)
    }

    async fn delayed_depth(&self) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(&self.delayed_key).await?)
    }

    async fn delayed_stats(&self) -> Result<DelayedStats, QueueError> {
        let total_delayed = self.delayed_depth().await?;
        let due_now = self.scan_due(Utc::now()).await?.len() as i64;
        Ok(DelayedStats {
            total_delayed,
            due_now,
            pending: total_delayed - due_now,
        })
    }

    async fn set_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", WORKER_KEY_PREFIX, worker_id);
        let _: () = conn.set_ex(key, "alive", ttl.as_secs()).await?;
        Ok(())
    }

    async fn list_active_workers(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", WORKER_KEY_PREFIX);

        let mut workers = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            if let Some(id) = key.strip_prefix(WORKER_KEY_PREFIX) {
                workers.push(id.to_string());
            }
        }

        Ok(workers)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Unavailable(format!("unexpected ping reply: {}", pong)))
        }
    }
}
