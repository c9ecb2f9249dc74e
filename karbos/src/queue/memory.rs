//! In-memory queue with the broker's delivery semantics.
//!
//! Pops are exactly-once (single lock around the deque), delayed scans are
//! repeatable until removal, and heartbeats expire by wall clock. Used by
//! tests for everything that takes `dyn JobQueue`.

use super::{JobQueue, QueueEntry, QueueError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    immediate: VecDeque<QueueEntry>,
    /// Keyed by (score, job id) so equal scores stay ordered and distinct.
    delayed: BTreeMap<(i64, Uuid), QueueEntry>,
    heartbeats: HashMap<String, Instant>,
}

/// In-memory [`JobQueue`] implementation.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue_immediate(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.inner.lock().unwrap().immediate.push_back(entry.clone());
        Ok(())
    }

    async fn dequeue_immediate(&self) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.inner.lock().unwrap().immediate.pop_front())
    }

    async fn enqueue_delayed(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.inner
            .lock()
            .unwrap()
            .delayed
            .insert((entry.score(), entry.job_id), entry.clone());
        Ok(())
    }

    async fn scan_due(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>, QueueError> {
        let cutoff = now.timestamp();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .delayed
            .iter()
            .take_while(|((score, _), _)| *score <= cutoff)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn remove_from_delayed(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner
            .delayed
            .iter()
            .find(|(_, entry)| entry.job_id == job_id)
            .map(|(key, _)| *key);

        match key {
            Some(key) => {
                inner.delayed.remove(&key);
                Ok(())
            }
            None => Err(QueueError::EntryNotFound(job_id)),
        }
    }

    async fn immediate_depth(&self) -> Result<i64, QueueError> {
        Ok(self.inner.lock().unwrap().immediate.len() as i64)
    }

    async fn delayed_depth(&self) -> Result<i64, QueueError> {
        Ok(self.inner.lock().unwrap().delayed.len() as i64)
    }

    async fn set_heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), QueueError> {
        self.inner
            .lock()
            .unwrap()
            .heartbeats
            .insert(worker_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn list_active_workers(&self) -> Result<Vec<String>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.heartbeats.retain(|_, expiry| *expiry > now);
        let mut workers: Vec<String> = inner.heartbeats.keys().cloned().collect();
        workers.sort();
        Ok(workers)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
