//! Carbon intelligence: providers, circuit breaker, and cache-first fetcher.
//!
//! External carbon-intensity providers are reached only through the
//! [`CircuitBreaker`], which absorbs every provider failure into a static
//! fallback. The [`CarbonFetcher`] layers the persistent cache in front so
//! the scheduling path usually never leaves the process boundary.

mod breaker;
mod electricity_maps;
mod fetcher;
mod http;
mod types;
mod watttime;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use electricity_maps::ElectricityMapsProvider;
pub use fetcher::{CarbonFetcher, DEFAULT_CACHE_TTL};
pub use http::{AsyncHttpClient, ReqwestClient, DEFAULT_HTTP_TIMEOUT};
pub use types::{
    CarbonProvider, IntensitySample, ProviderError, INTENSITY_UNIT, SOURCE_LIVE,
    SOURCE_STATIC_FALLBACK,
};
pub use watttime::WattTimeProvider;

#[cfg(test)]
pub use http::tests::MockHttpClient;
