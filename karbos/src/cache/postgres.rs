//! Postgres-backed intensity cache over the shared `carbon_cache` table.
//!
//! The table is shared-write across all API processes; upserts are
//! idempotent on the natural key via `ON CONFLICT`. Each row stores its
//! own `created_at` and `expires_at`, with `expires_at = created_at + ttl`
//! for the ttl passed to that upsert, so rows written with different TTLs
//! coexist and expire independently.

use super::{CacheError, CachedSample, IntensityCache, DEFAULT_FRESHNESS_BOUND};
use crate::carbon::IntensitySample;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct CarbonCacheRow {
    region: String,
    timestamp: DateTime<Utc>,
    intensity_value: f64,
    source: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CarbonCacheRow {
    fn into_sample(self) -> CachedSample {
        CachedSample {
            region: self.region,
            instant: self.timestamp,
            intensity: self.intensity_value,
            unit: crate::carbon::INTENSITY_UNIT.to_string(),
            source: self.source.unwrap_or_default(),
            fetched_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO carbon_cache (id, region, timestamp, intensity_value, forecast_window, source, created_at, expires_at)
    VALUES ($1, $2, $3, $4, 0, $5, $6, $7)
    ON CONFLICT (region, timestamp, forecast_window)
    DO UPDATE SET
        intensity_value = EXCLUDED.intensity_value,
        source = EXCLUDED.source,
        created_at = EXCLUDED.created_at,
        expires_at = EXCLUDED.expires_at
"#;

/// Postgres [`IntensityCache`] implementation.
pub struct PgIntensityCache {
    pool: PgPool,
    freshness_bound: Duration,
}

impl PgIntensityCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            freshness_bound: DEFAULT_FRESHNESS_BOUND,
        }
    }

    /// Overrides the bound beyond which rows are treated as missing.
    pub fn with_freshness_bound(mut self, bound: Duration) -> Self {
        self.freshness_bound = bound;
        self
    }

    fn expiry(fetched_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        fetched_at + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(1))
    }
}

#[async_trait]
impl IntensityCache for PgIntensityCache {
    async fn lookup_nearest(
        &self,
        region: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<CachedSample>, CacheError> {
        let freshness_cutoff = Utc::now()
            - ChronoDuration::from_std(self.freshness_bound).unwrap_or(ChronoDuration::hours(1));

        let row = sqlx::query_as::<_, CarbonCacheRow>(
            r#"
            SELECT region, timestamp, intensity_value, source, created_at, expires_at
            FROM carbon_cache
            WHERE region = $1
              AND timestamp >= $2 - INTERVAL '15 minutes'
              AND timestamp <= $2 + INTERVAL '15 minutes'
              AND created_at > $3
            ORDER BY ABS(EXTRACT(EPOCH FROM (timestamp - $2))) ASC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(region)
        .bind(instant)
        .bind(freshness_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CarbonCacheRow::into_sample))
    }

    async fn lookup_range(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CachedSample>, CacheError> {
        let rows = sqlx::query_as::<_, CarbonCacheRow>(
            r#"
            SELECT region, timestamp, intensity_value, source, created_at, expires_at
            FROM carbon_cache
            WHERE region = $1 AND timestamp BETWEEN $2 AND $3
            ORDER BY timestamp ASC
            "#,
        )
        .bind(region)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CarbonCacheRow::into_sample).collect())
    }

    async fn upsert(&self, sample: &IntensitySample, ttl: Duration) -> Result<(), CacheError> {
        let fetched_at = Utc::now();

        sqlx::query(UPSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(&sample.region)
            .bind(sample.instant)
            .bind(sample.intensity)
            .bind(&sample.source)
            .bind(fetched_at)
            .bind(Self::expiry(fetched_at, ttl))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn bulk_upsert(&self, samples: &[IntensitySample], ttl: Duration) -> Result<(), CacheError> {
        if samples.is_empty() {
            return Ok(());
        }

        let fetched_at = Utc::now();
        let expires_at = Self::expiry(fetched_at, ttl);

        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(UPSERT_SQL)
                .bind(Uuid::new_v4())
                .bind(&sample.region)
                .bind(sample.instant)
                .bind(sample.intensity)
                .bind(&sample.source)
                .bind(fetched_at)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn purge(&self, max_age: Duration) -> Result<u64, CacheError> {
        let cutoff = Utc::now() - ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::hours(24));

        let result = sqlx::query("DELETE FROM carbon_cache WHERE created_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_fetch_time_plus_the_requested_ttl() {
        let fetched_at = Utc::now();
        assert_eq!(
            PgIntensityCache::expiry(fetched_at, Duration::from_secs(1800)),
            fetched_at + ChronoDuration::minutes(30)
        );
        assert_eq!(
            PgIntensityCache::expiry(fetched_at, Duration::from_secs(7200)),
            fetched_at + ChronoDuration::hours(2)
        );
    }
}
