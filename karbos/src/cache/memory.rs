//! In-memory intensity cache.
//!
//! Mirrors the Postgres cache's semantics exactly, which makes it both a
//! test double for anything taking `dyn IntensityCache` and a usable cache
//! tier for single-process deployments without a relational store.

use super::{CacheError, CachedSample, IntensityCache, DEFAULT_FRESHNESS_BOUND, NEAREST_TOLERANCE};
use crate::carbon::IntensitySample;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Map key: (region, epoch second of the sample instant).
type Key = (String, i64);

/// In-memory [`IntensityCache`] implementation.
pub struct MemoryIntensityCache {
    rows: Mutex<BTreeMap<Key, CachedSample>>,
    freshness_bound: Duration,
}

impl MemoryIntensityCache {
    pub fn new() -> Self {
        Self::with_freshness_bound(DEFAULT_FRESHNESS_BOUND)
    }

    /// Overrides the bound beyond which rows are treated as missing.
    pub fn with_freshness_bound(freshness_bound: Duration) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            freshness_bound,
        }
    }

    /// Number of rows currently held.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn within_bound(&self, row: &CachedSample) -> bool {
        let bound = ChronoDuration::from_std(self.freshness_bound).unwrap_or(ChronoDuration::hours(1));
        Utc::now() - row.fetched_at < bound
    }
}

impl Default for MemoryIntensityCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntensityCache for MemoryIntensityCache {
    async fn lookup_nearest(
        &self,
        region: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<CachedSample>, CacheError> {
        let tolerance = NEAREST_TOLERANCE.as_secs() as i64;
        let target = instant.timestamp();
        let lo = (region.to_string(), target - tolerance);
        let hi = (region.to_string(), target + tolerance);

        let rows = self.rows.lock().unwrap();
        let best = rows
            .range(lo..=hi)
            .map(|(_, row)| row)
            .filter(|row| self.within_bound(row))
            // Smallest absolute delta wins; on a tie the freshest row wins.
            .min_by_key(|row| ((row.instant.timestamp() - target).abs(), std::cmp::Reverse(row.fetched_at)))
            .cloned();

        Ok(best)
    }

    async fn lookup_range(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CachedSample>, CacheError> {
        let lo = (region.to_string(), start.timestamp());
        let hi = (region.to_string(), end.timestamp());

        let rows = self.rows.lock().unwrap();
        Ok(rows.range(lo..=hi).map(|(_, row)| row.clone()).collect())
    }

    async fn upsert(&self, sample: &IntensitySample, ttl: Duration) -> Result<(), CacheError> {
        let row = CachedSample::from_sample(sample, ttl);
        let key = (row.region.clone(), row.instant.timestamp());
        self.rows.lock().unwrap().insert(key, row);
        Ok(())
    }

    async fn bulk_upsert(&self, samples: &[IntensitySample], ttl: Duration) -> Result<(), CacheError> {
        // Single lock acquisition makes the batch atomic for readers.
        let mut rows = self.rows.lock().unwrap();
        for sample in samples {
            let row = CachedSample::from_sample(sample, ttl);
            let key = (row.region.clone(), row.instant.timestamp());
            rows.insert(key, row);
        }
        Ok(())
    }

    async fn purge(&self, max_age: Duration) -> Result<u64, CacheError> {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(24));
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| row.fetched_at > cutoff);
        Ok((before - rows.len()) as u64)
    }
}
