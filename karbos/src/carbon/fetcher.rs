//! Cache-first carbon intensity fetching.
//!
//! The fetcher composes the intensity cache and the circuit breaker:
//!
//! 1. A fresh cache hit is returned without touching the provider.
//! 2. Otherwise the breaker is consulted; live responses are written back
//!    to the cache (best effort) before being returned.
//! 3. When the breaker served its static fallback but a stale cache entry
//!    exists, the stale entry wins. Observed data, even old, beats a
//!    synthetic constant. This is the only case where the fetcher
//!    overrides the breaker's output.
//!
//! Cache failures never fail a request; they degrade to the breaker path.

use super::breaker::CircuitBreaker;
use super::types::IntensitySample;
use crate::cache::{CacheError, IntensityCache};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default cache TTL and freshness horizon.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Fraction of the requested hours the cache must cover for a range read
/// to skip the provider.
const RANGE_COVERAGE_RATIO: f64 = 0.8;

/// Cache-first composition of the intensity cache and the circuit breaker.
pub struct CarbonFetcher {
    breaker: Arc<CircuitBreaker>,
    cache: Arc<dyn IntensityCache>,
    cache_ttl: Duration,
    max_cache_age: Duration,
}

impl CarbonFetcher {
    pub fn new(breaker: Arc<CircuitBreaker>, cache: Arc<dyn IntensityCache>, cache_ttl: Duration) -> Self {
        let ttl = if cache_ttl.is_zero() { DEFAULT_CACHE_TTL } else { cache_ttl };
        Self {
            breaker,
            cache,
            cache_ttl: ttl,
            max_cache_age: ttl,
        }
    }

    /// Intensity for a region at a specific instant.
    pub async fn intensity(&self, region: &str, instant: DateTime<Utc>) -> IntensitySample {
        let cached = match self.cache.lookup_nearest(region, instant).await {
            Ok(entry) => entry,
            Err(err) => {
                self.log_cache_error("lookup_nearest", &err);
                None
            }
        };

        if let Some(entry) = &cached {
            if self.cache.is_fresh(entry, self.max_cache_age) {
                debug!(region = region, "carbon intensity served from cache");
                return entry.to_sample();
            }
        }

        let live = self.breaker.current(region).await;

        if live.is_fallback() {
            // Stale-but-present beats the synthetic constant.
            if let Some(entry) = cached {
                warn!(region = region, "provider unavailable, using stale cache entry");
                return entry.to_sample();
            }
            return live;
        }

        if let Err(err) = self.cache.upsert(&live, self.cache_ttl).await {
            self.log_cache_error("upsert", &err);
        }
        live
    }

    /// Current intensity for a region.
    pub async fn current(&self, region: &str) -> IntensitySample {
        self.intensity(region, Utc::now()).await
    }

    /// Forecast for `[start, end]`.
    ///
    /// The cache satisfies the read iff it covers at least 80% of the
    /// requested hours and every returned row is fresh. On provider
    /// failure a non-empty cache subset is preferred over the static
    /// fallback forecast.
    pub async fn forecast(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<IntensitySample> {
        let cached = match self.cache.lookup_range(region, start, end).await {
            Ok(rows) => rows,
            Err(err) => {
                self.log_cache_error("lookup_range", &err);
                Vec::new()
            }
        };

        let required_hours = (end - start).num_hours().max(0) as f64;
        let required_rows = (required_hours * RANGE_COVERAGE_RATIO) as usize;

        if !cached.is_empty() && cached.len() >= required_rows {
            let all_fresh = cached.iter().all(|row| self.cache.is_fresh(row, self.max_cache_age));
            if all_fresh {
                debug!(region = region, rows = cached.len(), "carbon forecast served from cache");
                return cached.iter().map(|row| row.to_sample()).collect();
            }
        }

        let samples = self.breaker.forecast(region, start, end).await;

        let is_fallback = samples.first().map(|s| s.is_fallback()).unwrap_or(false);
        if is_fallback {
            if !cached.is_empty() {
                warn!(
                    region = region,
                    cached_rows = cached.len(),
                    "provider unavailable, serving partial cache forecast"
                );
                return cached.iter().map(|row| row.to_sample()).collect();
            }
            return samples;
        }

        if !samples.is_empty() {
            if let Err(err) = self.cache.bulk_upsert(&samples, self.cache_ttl).await {
                self.log_cache_error("bulk_upsert", &err);
            }
        }
        samples
    }

    /// Forecast for the next `hours` hours.
    pub async fn forecast_window(&self, region: &str, hours: i64) -> Vec<IntensitySample> {
        let now = Utc::now();
        self.forecast(region, now, now + ChronoDuration::hours(hours)).await
    }

    fn log_cache_error(&self, op: &str, err: &CacheError) {
        warn!(op = op, error = %err, "cache unavailable, continuing against provider");
    }
}
