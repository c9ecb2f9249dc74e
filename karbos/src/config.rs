//! Application configuration.
//!
//! Pure-data settings structs, one per subsystem, loaded from environment
//! variables with defaults for everything except `DATABASE_URL`. Every
//! timeout and knob documented for the core is represented here so a
//! deployment can override it without code changes.

use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
}

/// Complete configuration for either process role.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub promoter: PromoterSettings,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
    pub provider: ProviderSettings,
    pub executor: ExecutorSettings,
}

/// Relational store connection.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
}

/// Broker connection and lane keys.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: u8,
    pub immediate_key: String,
    pub delayed_key: String,
}

impl RedisSettings {
    /// Connection URL for the redis client.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

/// Worker pool knobs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Operator grace window for the drain on shutdown.
    pub drain_budget: Duration,
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub slot_size: Duration,
    /// Intensity under which jobs always run immediately (gCO2eq/kWh).
    pub threshold: f64,
    pub window: Duration,
}

/// Promoter knobs.
#[derive(Debug, Clone)]
pub struct PromoterSettings {
    pub interval: Duration,
}

/// Intensity cache knobs.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
}

/// Circuit breaker knobs.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub timeout: Duration,
    pub reset_timeout: Duration,
    pub static_fallback: f64,
}

/// Carbon provider endpoint and credential.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Empty means the provider's default endpoint.
    pub base_url: String,
    pub credential: String,
}

/// Container executor knobs.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub memory_limit: i64,
    pub cpu_quota: i64,
}

impl Config {
    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").unwrap_or_default();
        if database_url.is_empty() {
            return Err(ConfigError::MissingVar("DATABASE_URL"));
        }

        Ok(Self {
            database: DatabaseSettings { url: database_url },
            redis: RedisSettings {
                host: get_env("REDIS_HOST", "localhost"),
                port: get_env_parse("REDIS_PORT", 6379),
                password: get_env("REDIS_PASSWORD", ""),
                db: get_env_parse("REDIS_DB", 0),
                immediate_key: get_env("IMMEDIATE_QUEUE_KEY", crate::queue::IMMEDIATE_QUEUE_KEY),
                delayed_key: get_env("DELAYED_SET_KEY", crate::queue::DELAYED_SET_KEY),
            },
            worker: WorkerSettings {
                pool_size: get_env_parse("WORKER_POOL_SIZE", 5),
                poll_interval: secs("WORKER_POLL_INTERVAL_SECS", 2),
                job_timeout: secs("WORKER_JOB_TIMEOUT_SECS", 600),
                drain_budget: secs("WORKER_DRAIN_BUDGET_SECS", 30),
            },
            scheduler: SchedulerSettings {
                slot_size: secs("SCHEDULER_SLOT_SIZE_SECS", 3600),
                threshold: get_env_parse("SCHEDULER_THRESHOLD", 400.0),
                window: secs("SCHEDULER_WINDOW_SECS", 24 * 3600),
            },
            promoter: PromoterSettings {
                interval: secs("PROMOTER_INTERVAL_SECS", 10),
            },
            cache: CacheSettings {
                ttl: secs("CACHE_TTL_SECS", 3600),
            },
            breaker: BreakerSettings {
                max_failures: get_env_parse("BREAKER_MAX_FAILURES", 5),
                timeout: secs("BREAKER_TIMEOUT_SECS", 30),
                reset_timeout: secs("BREAKER_RESET_TIMEOUT_SECS", 10),
                static_fallback: get_env_parse("BREAKER_STATIC_FALLBACK", 400.0),
            },
            provider: ProviderSettings {
                base_url: get_env("CARBON_PROVIDER_BASE_URL", ""),
                credential: get_env("CARBON_PROVIDER_CREDENTIAL", ""),
            },
            executor: ExecutorSettings {
                memory_limit: get_env_parse("EXECUTOR_MEMORY_LIMIT", 512 * 1024 * 1024_i64),
                cpu_quota: get_env_parse("EXECUTOR_CPU_QUOTA", 50_000_i64),
            },
        })
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            warn!(key = key, value = %value, "invalid value, using default");
            default
        }),
        _ => default,
    }
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(get_env_parse(key, default))
}
