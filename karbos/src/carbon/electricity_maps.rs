//! ElectricityMaps provider (zone-keyed).
//!
//! Speaks the v3 API: `/carbon-intensity/latest?zone=` for the current
//! reading and `/carbon-intensity/forecast?zone=` for hourly forecast
//! points. Authenticates with an `auth-token` header.

use super::http::AsyncHttpClient;
use super::types::{CarbonProvider, IntensitySample, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.electricitymap.org/v3";

#[derive(Debug, Deserialize)]
struct LatestResponse {
    zone: String,
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
    datetime: String,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    zone: String,
    forecast: Vec<ForecastPoint>,
}

#[derive(Debug, Deserialize)]
struct ForecastPoint {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: f64,
    datetime: String,
}

/// ElectricityMaps API client.
pub struct ElectricityMapsProvider<C: AsyncHttpClient> {
    http: C,
    api_key: String,
    base_url: String,
}

impl<C: AsyncHttpClient> ElectricityMapsProvider<C> {
    /// Creates a provider against the default endpoint.
    pub fn new(http: C, api_key: impl Into<String>) -> Self {
        Self::with_base_url(http, api_key, DEFAULT_BASE_URL)
    }

    /// Creates a provider against a custom endpoint (staging, tests).
    pub fn with_base_url(http: C, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        self.http
            .get_with_headers(url, &[("auth-token", &self.api_key), ("Content-Type", "application/json")])
            .await
    }
}

#[async_trait]
impl<C: AsyncHttpClient> CarbonProvider for ElectricityMapsProvider<C> {
    async fn current(&self, region: &str) -> Result<IntensitySample, ProviderError> {
        let url = format!("{}/carbon-intensity/latest?zone={}", self.base_url, region);
        let body = self.get_json(&url).await?;

        let resp: LatestResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("failed to decode latest response: {}", e)))?;

        // The upstream datetime is occasionally missing or malformed; fall
        // back to the request time rather than failing the whole call.
        let instant = DateTime::parse_from_rfc3339(&resp.datetime)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(IntensitySample::live(resp.zone, instant, resp.carbon_intensity))
    }

    async fn forecast(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntensitySample>, ProviderError> {
        let url = format!("{}/carbon-intensity/forecast?zone={}", self.base_url, region);
        let body = self.get_json(&url).await?;

        let resp: ForecastResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("failed to decode forecast response: {}", e)))?;

        let mut samples = Vec::with_capacity(resp.forecast.len());
        for point in resp.forecast {
            // Skip points with unparseable timestamps instead of failing.
            let Ok(parsed) = DateTime::parse_from_rfc3339(&point.datetime) else {
                continue;
            };
            let instant = parsed.with_timezone(&Utc);
            if instant < start || instant > end {
                continue;
            }
            samples.push(IntensitySample::live(resp.zone.clone(), instant, point.carbon_intensity));
        }

        debug!(region = region, samples = samples.len(), "ElectricityMaps forecast fetched");
        Ok(samples)
    }

    fn name(&self) -> &str {
        "electricity-maps"
    }
}
