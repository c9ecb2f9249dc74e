//! Carbon provider types and traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit string carried on every intensity sample.
pub const INTENSITY_UNIT: &str = "gCO2eq/kWh";

/// Provenance value for samples fetched live from a provider.
pub const SOURCE_LIVE: &str = "api";

/// Provenance value for samples synthesized by the circuit breaker.
pub const SOURCE_STATIC_FALLBACK: &str = "static-fallback";

/// Errors that can occur during provider operations.
///
/// The core treats every variant as a transient failure: all of them count
/// toward opening the circuit breaker and none of them reach a submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider endpoint could not be reached.
    Unreachable(String),
    /// Credentials were rejected.
    AuthFailed(String),
    /// The provider throttled the request.
    RateLimited(String),
    /// The response could not be decoded.
    Malformed(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unreachable(msg) => write!(f, "provider unreachable: {}", msg),
            ProviderError::AuthFailed(msg) => write!(f, "provider auth failed: {}", msg),
            ProviderError::RateLimited(msg) => write!(f, "provider rate limited: {}", msg),
            ProviderError::Malformed(msg) => write!(f, "malformed provider response: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// A single grid carbon-intensity reading.
///
/// Live samples and static-fallback samples share this one shape; the
/// [`source`](IntensitySample::source) field carries the distinction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntensitySample {
    /// Grid region the reading applies to.
    pub region: String,
    /// Instant the reading is valid for (hourly granularity for forecasts).
    pub instant: DateTime<Utc>,
    /// Carbon intensity in grams of CO2 equivalent per kilowatt-hour.
    pub intensity: f64,
    /// Always [`INTENSITY_UNIT`].
    pub unit: String,
    /// Where the value came from: [`SOURCE_LIVE`] or [`SOURCE_STATIC_FALLBACK`].
    pub source: String,
}

impl IntensitySample {
    /// Builds a live sample.
    pub fn live(region: impl Into<String>, instant: DateTime<Utc>, intensity: f64) -> Self {
        Self {
            region: region.into(),
            instant,
            intensity,
            unit: INTENSITY_UNIT.to_string(),
            source: SOURCE_LIVE.to_string(),
        }
    }

    /// Builds a synthetic fallback sample.
    pub fn static_fallback(region: impl Into<String>, instant: DateTime<Utc>, intensity: f64) -> Self {
        Self {
            region: region.into(),
            instant,
            intensity,
            unit: INTENSITY_UNIT.to_string(),
            source: SOURCE_STATIC_FALLBACK.to_string(),
        }
    }

    /// Whether this sample was synthesized by the breaker rather than
    /// observed from a provider or the cache.
    pub fn is_fallback(&self) -> bool {
        self.source == SOURCE_STATIC_FALLBACK
    }
}

/// Capability for fetching grid carbon intensity per region.
///
/// Implementations return hourly-granularity samples with monotonically
/// increasing instants. Every call is bounded by the client's 10-second
/// timeout. The core only ever calls a provider through the circuit
/// breaker, never directly.
#[async_trait]
pub trait CarbonProvider: Send + Sync {
    /// Fetches the current intensity for a region.
    async fn current(&self, region: &str) -> Result<IntensitySample, ProviderError>;

    /// Fetches forecast samples within `[start, end]`, ordered by instant
    /// ascending. Points outside the range are filtered out.
    async fn forecast(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntensitySample>, ProviderError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_sample_carries_unit_and_source() {
        let sample = IntensitySample::live("US-EAST", Utc::now(), 412.5);
        assert_eq!(sample.unit, INTENSITY_UNIT);
        assert_eq!(sample.source, SOURCE_LIVE);
        assert!(!sample.is_fallback());
    }

    #[test]
    fn fallback_sample_is_distinguishable_only_by_source() {
        let now = Utc::now();
        let live = IntensitySample::live("US-EAST", now, 400.0);
        let synthetic = IntensitySample::static_fallback("US-EAST", now, 400.0);

        assert_eq!(live.intensity, synthetic.intensity);
        assert_eq!(live.unit, synthetic.unit);
        assert!(synthetic.is_fallback());
        assert_ne!(live.source, synthetic.source);
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::RateLimited("429 from upstream".to_string());
        assert_eq!(format!("{}", err), "provider rate limited: 429 from upstream");
    }
}
