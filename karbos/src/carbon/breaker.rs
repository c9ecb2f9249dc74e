//! Circuit breaker around the carbon provider.
//!
//! Protects the scheduling path from a failing provider by serving a
//! deterministic static fallback instead of propagating errors.
//!
//! # State Machine
//!
//! ```text
//! Closed --[max_failures consecutive failures]--> Open
//! Open --[timeout elapsed, next request probes]--> HalfOpen
//! HalfOpen --[probe succeeds]--> Closed
//! HalfOpen --[probe fails]--> Open (timer reset)
//! ```
//!
//! The breaker never raises the underlying provider error to its caller:
//! in Open state and on every failure path it returns synthetic samples
//! with `source = "static-fallback"`. Callers can only tell synthetic from
//! live data by provenance.
//!
//! # Thread Safety
//!
//! All state lives behind a single `Mutex` held across read-and-transition,
//! never across the provider I/O itself. HalfOpen admits exactly one
//! in-flight probe; concurrent requests during the probe get the fallback.

use super::types::{CarbonProvider, IntensitySample, ProviderError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens (default: 5).
    pub max_failures: u32,
    /// How long the circuit stays open before probing (default: 30s).
    pub timeout: Duration,
    /// Administrative knob: minimum interval between forced resets
    /// (default: 10s).
    pub reset_timeout: Duration,
    /// Intensity served while the provider is unavailable, in gCO2eq/kWh
    /// (default: 400, a global-average figure).
    pub static_fallback: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(10),
            static_fallback: 400.0,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through to the provider.
    Closed,
    /// Requests are answered from the static fallback.
    Open,
    /// One probe request is testing provider recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Point-in-time snapshot of breaker internals, for observability surfaces.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: u32,
    pub max_failures: u32,
    pub static_fallback: f64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_transition: Instant,
    probe_in_flight: bool,
}

/// Three-state wrapper around a [`CarbonProvider`] with a static fallback.
pub struct CircuitBreaker {
    provider: Arc<dyn CarbonProvider>,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: Arc<dyn CarbonProvider>, config: BreakerConfig) -> Self {
        Self {
            provider,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_transition: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    /// Current intensity for a region. Always returns a value; synthetic
    /// data carries `source = "static-fallback"`.
    pub async fn current(&self, region: &str) -> IntensitySample {
        if !self.admit() {
            return self.fallback_sample(region, Utc::now());
        }

        match self.provider.current(region).await {
            Ok(sample) => {
                self.record_success();
                sample
            }
            Err(err) => {
                self.record_failure(&err);
                self.fallback_sample(region, Utc::now())
            }
        }
    }

    /// Forecast for `[start, end]`. Always returns a value; synthetic data
    /// is hourly rows at the configured static intensity.
    pub async fn forecast(
        &self,
        region: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<IntensitySample> {
        if !self.admit() {
            return self.fallback_forecast(region, start, end);
        }

        match self.provider.forecast(region, start, end).await {
            Ok(samples) => {
                self.record_success();
                samples
            }
            Err(err) => {
                self.record_failure(&err);
                self.fallback_forecast(region, start, end)
            }
        }
    }

    /// Decides whether a request may reach the provider, transitioning
    /// Open to HalfOpen when the timeout has elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.last_transition.elapsed() >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = Instant::now();
                    inner.probe_in_flight = true;
                    info!(provider = self.provider.name(), "circuit breaker half-open, probing provider");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => {
                if inner.failures > 0 {
                    info!(
                        provider = self.provider.name(),
                        failures = inner.failures,
                        "provider recovered, failure count reset"
                    );
                    inner.failures = 0;
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.probe_in_flight = false;
                inner.last_transition = Instant::now();
                info!(provider = self.provider.name(), "circuit breaker closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: &ProviderError) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.max_failures {
                    inner.state = CircuitState::Open;
                    inner.last_transition = Instant::now();
                    warn!(
                        provider = self.provider.name(),
                        failures = inner.failures,
                        error = %err,
                        fallback = self.config.static_fallback,
                        "circuit breaker opened, serving static fallback"
                    );
                } else {
                    warn!(
                        provider = self.provider.name(),
                        failures = inner.failures,
                        max_failures = self.config.max_failures,
                        error = %err,
                        "provider call failed"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failures = self.config.max_failures;
                inner.probe_in_flight = false;
                inner.last_transition = Instant::now();
                warn!(provider = self.provider.name(), error = %err, "probe failed, circuit breaker back to open");
            }
            CircuitState::Open => {}
        }
    }

    fn fallback_sample(&self, region: &str, instant: DateTime<Utc>) -> IntensitySample {
        IntensitySample::static_fallback(region, instant, self.config.static_fallback)
    }

    /// Hourly synthetic rows spanning `[start, end)`.
    fn fallback_forecast(&self, region: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<IntensitySample> {
        let mut forecast = Vec::new();
        let mut current = start;
        while current < end {
            forecast.push(self.fallback_sample(region, current));
            current += ChronoDuration::hours(1);
        }
        forecast
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Current failure counter.
    pub fn failures(&self) -> u32 {
        self.inner.lock().unwrap().failures
    }

    /// Snapshot for observability surfaces.
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap();
        BreakerStats {
            state: inner.state,
            failures: inner.failures,
            max_failures: self.config.max_failures,
            static_fallback: self.config.static_fallback,
        }
    }

    /// Administrative reset: forces the circuit closed and zeroes counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
        inner.last_transition = Instant::now();
        info!(provider = self.provider.name(), "circuit breaker manually reset to closed");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Scripted provider: pops one result per call, repeating the last.
    pub(crate) struct ScriptedProvider {
        script: Mutex<Vec<Result<f64, ProviderError>>>,
        pub calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Result<f64, ProviderError>>) -> Self {
            assert!(!script.is_empty());
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        pub fn failing() -> Self {
            Self::new(vec![Err(ProviderError::Unreachable("down".to_string()))])
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        fn next(&self) -> Result<f64, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    #[async_trait]
    impl CarbonProvider for ScriptedProvider {
        async fn current(&self, region: &str) -> Result<IntensitySample, ProviderError> {
            self.next().map(|v| IntensitySample::live(region, Utc::now(), v))
        }

        async fn forecast(
            &self,
            region: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<IntensitySample>, ProviderError> {
            let base = self.next()?;
            let mut out = Vec::new();
            let mut t = start;
            while t < end {
                out.push(IntensitySample::live(region, t, base));
                t += ChronoDuration::hours(1);
            }
            Ok(out)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            timeout: Duration::from_millis(50),
            reset_timeout: Duration::from_millis(10),
            static_fallback: 400.0,
        }
    }

    #[tokio::test]
    async fn closed_passes_through_live_data() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(250.0)]));
        let breaker = CircuitBreaker::new(provider.clone(), quick_config());

        let sample = breaker.current("US-EAST").await;
        assert_eq!(sample.intensity, 250.0);
        assert!(!sample.is_fallback());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_max_failures_and_stops_calling_provider() {
        let provider = Arc::new(ScriptedProvider::failing());
        let breaker = CircuitBreaker::new(provider.clone(), quick_config());

        for _ in 0..3 {
            let sample = breaker.current("US-EAST").await;
            // Failure paths still answer with the fallback value.
            assert!(sample.is_fallback());
            assert_eq!(sample.intensity, 400.0);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(provider.call_count(), 3);

        // Open circuit: provider is no longer consulted.
        let sample = breaker.current("US-EAST").await;
        assert!(sample.is_fallback());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn open_serves_hourly_fallback_forecast() {
        let provider = Arc::new(ScriptedProvider::failing());
        let breaker = CircuitBreaker::new(provider, quick_config());

        for _ in 0..3 {
            breaker.current("US-EAST").await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let start: DateTime<Utc> = "2025-12-04T14:00:00Z".parse().unwrap();
        let end = start + ChronoDuration::hours(6);
        let forecast = breaker.forecast("US-EAST", start, end).await;

        assert_eq!(forecast.len(), 6);
        assert!(forecast.iter().all(|s| s.is_fallback() && s.intensity == 400.0));
        assert_eq!(forecast[0].instant, start);
        assert_eq!(forecast[5].instant, start + ChronoDuration::hours(5));
    }

    #[tokio::test]
    async fn full_recovery_cycle_closed_open_half_open_closed() {
        // Three failures, then a healthy provider.
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Unreachable("down".to_string())),
            Err(ProviderError::Unreachable("down".to_string())),
            Err(ProviderError::Unreachable("down".to_string())),
            Ok(300.0),
        ]));
        let breaker = CircuitBreaker::new(provider.clone(), quick_config());

        for _ in 0..3 {
            breaker.current("US-EAST").await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Wait out the open timeout; the next request is the probe.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sample = breaker.current("US-EAST").await;

        assert_eq!(sample.intensity, 300.0);
        assert!(!sample.is_fallback());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let provider = Arc::new(ScriptedProvider::failing());
        let breaker = CircuitBreaker::new(provider.clone(), quick_config());

        for _ in 0..3 {
            breaker.current("US-EAST").await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sample = breaker.current("US-EAST").await;
        assert!(sample.is_fallback());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(provider.call_count(), 4);

        // Fresh open window: no provider call until it elapses again.
        breaker.current("US-EAST").await;
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn success_resets_failure_counter_in_closed() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Unreachable("down".to_string())),
            Err(ProviderError::Unreachable("down".to_string())),
            Ok(200.0),
            Err(ProviderError::Unreachable("down".to_string())),
        ]));
        let breaker = CircuitBreaker::new(provider, quick_config());

        breaker.current("US-EAST").await;
        breaker.current("US-EAST").await;
        assert_eq!(breaker.failures(), 2);

        breaker.current("US-EAST").await;
        assert_eq!(breaker.failures(), 0);

        // A single new failure does not open the circuit.
        breaker.current("US-EAST").await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 1);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let provider = Arc::new(ScriptedProvider::failing());
        let breaker = CircuitBreaker::new(provider.clone(), quick_config());

        for _ in 0..3 {
            breaker.current("US-EAST").await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);

        // Closed again: the provider is consulted on the next request.
        breaker.current("US-EAST").await;
        assert_eq!(provider.call_count(), 4);
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.max_failures, 5);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.reset_timeout, Duration::from_secs(10));
        assert_eq!(config.static_fallback, 400.0);
    }
}
