//! Karbos - carbon-aware batch job scheduling.
//!
//! Users submit containerized work with a hard completion deadline; the
//! system decides *when* each job should execute so that the average grid
//! carbon intensity during execution is minimized, then queues, dispatches,
//! and runs it on a pool of container workers.
//!
//! # Architecture
//!
//! ```text
//! submit ──► JobService ──► CarbonScheduler ──► CarbonFetcher
//!                │                                 │
//!                │                         IntensityCache ── CircuitBreaker ── provider
//!                ▼
//!            JobStore (Postgres)
//!                │
//!                ▼
//!            JobQueue (Redis) ── immediate lane ──► WorkerPool ──► ContainerExecutor
//!                   │                  ▲
//!                   └── delayed lane ──┘ (Promoter)
//! ```
//!
//! Every collaborator is a capability trait (`JobStore`, `JobQueue`,
//! `IntensityCache`, `ContainerExecutor`, `ForecastSource`) with a
//! production implementation and an in-memory double, so the core can be
//! exercised end-to-end without Postgres, Redis, or Docker.
//!
//! A worker mid-cancellation may leave a job in `Running` if its final
//! status write fails; recovery of long-stale `Running` rows is left to a
//! deployment-level reconciliation job.

pub mod cache;
pub mod carbon;
pub mod config;
pub mod executor;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod worker;

/// Version of the karbos library and binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
