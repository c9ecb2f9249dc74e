//! Persistent, TTL-bounded cache of carbon-intensity samples.
//!
//! The cache is keyed by the natural key `(region, instant)`: upserts
//! overwrite on that key, nearest-lookups resolve to the closest instant
//! within a ±15 minute tolerance, and range reads return rows ordered by
//! instant ascending.
//!
//! Two implementations are provided: [`PgIntensityCache`] backed by the
//! shared `carbon_cache` table, and [`MemoryIntensityCache`] for tests and
//! single-process deployments.

mod memory;
mod postgres;

pub use memory::MemoryIntensityCache;
pub use postgres::PgIntensityCache;

use crate::carbon::{IntensitySample, SOURCE_LIVE};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use thiserror::Error;

/// Tolerance applied by nearest-instant lookups.
pub const NEAREST_TOLERANCE: Duration = Duration::from_secs(15 * 60);

/// Default freshness bound: rows older than this are treated as missing.
pub const DEFAULT_FRESHNESS_BOUND: Duration = Duration::from_secs(60 * 60);

/// Errors from cache operations.
///
/// Callers treat these as a quality-of-service degradation: a failing cache
/// never fails a request, it just forces the provider path.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CacheError::Unavailable(err.to_string())
            }
            other => CacheError::Query(other.to_string()),
        }
    }
}

/// A cached intensity sample together with its cache bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSample {
    pub region: String,
    pub instant: DateTime<Utc>,
    pub intensity: f64,
    pub unit: String,
    pub source: String,
    /// When the row was written.
    pub fetched_at: DateTime<Utc>,
    /// When the row stops being servable: always `fetched_at + ttl`.
    pub expires_at: DateTime<Utc>,
}

impl CachedSample {
    /// Builds cache bookkeeping around a sample at write time.
    pub fn from_sample(sample: &IntensitySample, ttl: Duration) -> Self {
        let fetched_at = Utc::now();
        Self {
            region: sample.region.clone(),
            instant: sample.instant,
            intensity: sample.intensity,
            unit: sample.unit.clone(),
            source: sample.source.clone(),
            fetched_at,
            expires_at: fetched_at + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(1)),
        }
    }

    /// Strips cache bookkeeping back off.
    pub fn to_sample(&self) -> IntensitySample {
        IntensitySample {
            region: self.region.clone(),
            instant: self.instant,
            intensity: self.intensity,
            unit: self.unit.clone(),
            source: if self.source.is_empty() {
                SOURCE_LIVE.to_string()
            } else {
                self.source.clone()
            },
        }
    }
}

/// Capability set for the intensity cache.
#[async_trait]
pub trait IntensityCache: Send + Sync {
    /// Returns the sample whose instant lies within ±15 minutes of the
    /// requested instant, or `None`. Ties break to the smallest absolute
    /// delta, then to the most recently fetched row. Rows aged beyond the
    /// cache's freshness bound are a miss.
    async fn lookup_nearest(
        &self,
        region: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<CachedSample>, CacheError>;

    /// Returns all samples in `[start, end]` ordered by instant ascending.
    async fn lookup_range(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CachedSample>, CacheError>;

    /// Inserts or overwrites by `(region, instant)`, setting
    /// `expires_at = now + ttl`.
    async fn upsert(&self, sample: &IntensitySample, ttl: Duration) -> Result<(), CacheError>;

    /// Transactional bulk upsert: either all rows persist or none.
    async fn bulk_upsert(&self, samples: &[IntensitySample], ttl: Duration) -> Result<(), CacheError>;

    /// Deletes rows older than `max_age`; returns the count purged.
    async fn purge(&self, max_age: Duration) -> Result<u64, CacheError>;

    /// True iff `now - sample.fetched_at < max_age`.
    fn is_fresh(&self, sample: &CachedSample, max_age: Duration) -> bool {
        let age = Utc::now() - sample.fetched_at;
        age < ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(1))
    }
}
