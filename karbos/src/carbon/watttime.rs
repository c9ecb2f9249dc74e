//! WattTime provider (balancing-authority keyed).
//!
//! WattTime reports a relative index in [0, 100] rather than an absolute
//! intensity. The index is linearly rescaled to [0, 800] gCO2eq/kWh so all
//! providers share one unit. Authentication is a `/login` round trip with
//! basic auth yielding a bearer token, cached for 30 minutes.

use super::http::AsyncHttpClient;
use super::types::{CarbonProvider, IntensitySample, ProviderError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use tracing::debug;

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api2.watttime.org/v2";

/// Scale factor applied to the [0, 100] index.
const INDEX_SCALE_MAX: f64 = 800.0;

/// How long a bearer token is reused before re-authenticating.
const TOKEN_LIFETIME_MINS: i64 = 30;

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    ba: String,
    percent: f64,
    #[serde(rename = "point_time")]
    point_time: String,
}

/// WattTime API client.
pub struct WattTimeProvider<C: AsyncHttpClient> {
    http: C,
    username: String,
    password: String,
    base_url: String,
    token: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl<C: AsyncHttpClient> WattTimeProvider<C> {
    pub fn new(http: C, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_base_url(http, username, password, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        http: C,
        username: impl Into<String>,
        password: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            username: username.into(),
            password: password.into(),
            base_url: base_url.into(),
            token: Mutex::new(None),
        }
    }

    /// Converts the relative index into gCO2eq/kWh.
    fn rescale(percent: f64) -> f64 {
        (percent / 100.0) * INDEX_SCALE_MAX
    }

    async fn bearer_token(&self) -> Result<String, ProviderError> {
        if let Some((token, expiry)) = self.token.lock().unwrap().clone() {
            if Utc::now() < expiry {
                return Ok(token);
            }
        }

        let url = format!("{}/login", self.base_url);
        let body = self
            .http
            .get_with_basic_auth(&url, &self.username, &self.password)
            .await?;

        let resp: LoginResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("failed to decode login response: {}", e)))?;

        let expiry = Utc::now() + Duration::minutes(TOKEN_LIFETIME_MINS);
        *self.token.lock().unwrap() = Some((resp.token.clone(), expiry));
        debug!("WattTime token refreshed");

        Ok(resp.token)
    }

    fn parse_point(point: IndexResponse) -> Option<IntensitySample> {
        let instant = DateTime::parse_from_rfc3339(&point.point_time)
            .map(|t| t.with_timezone(&Utc))
            .ok()?;
        Some(IntensitySample::live(point.ba, instant, Self::rescale(point.percent)))
    }
}

#[async_trait]
impl<C: AsyncHttpClient> CarbonProvider for WattTimeProvider<C> {
    async fn current(&self, region: &str) -> Result<IntensitySample, ProviderError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/index?ba={}", self.base_url, region);
        let auth = format!("Bearer {}", token);
        let body = self.http.get_with_headers(&url, &[("Authorization", &auth)]).await?;

        let resp: IndexResponse = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("failed to decode index response: {}", e)))?;

        let instant = DateTime::parse_from_rfc3339(&resp.point_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(IntensitySample::live(resp.ba, instant, Self::rescale(resp.percent)))
    }

    async fn forecast(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntensitySample>, ProviderError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/forecast?ba={}", self.base_url, region);
        let auth = format!("Bearer {}", token);
        let body = self.http.get_with_headers(&url, &[("Authorization", &auth)]).await?;

        let points: Vec<IndexResponse> = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Malformed(format!("failed to decode forecast response: {}", e)))?;

        let samples = points
            .into_iter()
            .filter_map(Self::parse_point)
            .filter(|s| s.instant >= start && s.instant <= end)
            .collect();

        Ok(samples)
    }

    fn name(&self) -> &str {
        "watttime"
    }
}

#[cfg(test)]
mod tests {
    use super::super::http::tests::MockHttpClient;
    use super::*;

    #[test]
    fn rescale_maps_index_onto_intensity_range() {
        let client = MockHttpClient::new(Ok(vec![]));
        let _provider = WattTimeProvider::with_base_url(client, "u", "p", "http://test");
        assert_eq!(WattTimeProvider::<MockHttpClient>::rescale(0.0), 0.0);
        assert_eq!(WattTimeProvider::<MockHttpClient>::rescale(50.0), 400.0);
        assert_eq!(WattTimeProvider::<MockHttpClient>::rescale(100.0), 800.0);
    }

    #[tokio::test]
    async fn current_authenticates_then_fetches_index() {
        let mock = MockHttpClient::with_script(vec![
            Ok(br#"{"token":"t-123"}"#.to_vec()),
            Ok(br#"{"ba":"CAISO","percent":25.0,"point_time":"2025-12-04T14:00:00Z"}"#.to_vec()),
        ]);
        let provider = WattTimeProvider::with_base_url(mock, "u", "p", "http://test");

        let sample = provider.current("CAISO").await.unwrap();
        assert_eq!(sample.region, "CAISO");
        assert_eq!(sample.intensity, 200.0);
        assert_eq!(provider.http.call_count(), 2);
        assert_eq!(provider.http.calls.lock().unwrap()[0], "http://test/login");
    }

    #[tokio::test]
    async fn token_is_reused_across_calls() {
        let mock = MockHttpClient::with_script(vec![
            Ok(br#"{"token":"t-123"}"#.to_vec()),
            Ok(br#"{"ba":"CAISO","percent":25.0,"point_time":"2025-12-04T14:00:00Z"}"#.to_vec()),
            Ok(br#"{"ba":"CAISO","percent":50.0,"point_time":"2025-12-04T15:00:00Z"}"#.to_vec()),
        ]);
        let provider = WattTimeProvider::with_base_url(mock, "u", "p", "http://test");

        provider.current("CAISO").await.unwrap();
        let second = provider.current("CAISO").await.unwrap();

        // One login plus two index calls: the cached token was reused.
        assert_eq!(provider.http.call_count(), 3);
        assert_eq!(second.intensity, 400.0);
    }

    #[tokio::test]
    async fn auth_failure_propagates_as_provider_error() {
        let mock = MockHttpClient::new(Err(ProviderError::AuthFailed("401".to_string())));
        let provider = WattTimeProvider::with_base_url(mock, "u", "bad", "http://test");

        let err = provider.current("CAISO").await.unwrap_err();
        assert!(matches!(err, ProviderError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn forecast_rescales_every_point() {
        let mock = MockHttpClient::with_script(vec![
            Ok(br#"{"token":"t-123"}"#.to_vec()),
            Ok(br#"[
                {"ba":"CAISO","percent":10.0,"point_time":"2025-12-04T14:00:00Z"},
                {"ba":"CAISO","percent":20.0,"point_time":"2025-12-04T15:00:00Z"}
            ]"#
            .to_vec()),
        ]);
        let provider = WattTimeProvider::with_base_url(mock, "u", "p", "http://test");

        let start: DateTime<Utc> = "2025-12-04T14:00:00Z".parse().unwrap();
        let end: DateTime<Utc> = "2025-12-04T20:00:00Z".parse().unwrap();
        let samples = provider.forecast("CAISO", start, end).await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].intensity, 80.0);
        assert_eq!(samples[1].intensity, 160.0);
    }
}
