//! Worker-role runtime: pool, consumers, promoter, and heartbeat.

mod consumer;
mod heartbeat;
mod pool;
mod promoter;

pub use heartbeat::Heartbeat;
pub use pool::{PoolConfig, WorkerPool, DEFAULT_JOB_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_POOL_SIZE};
pub use promoter::{Promoter, PromoterStatus, DEFAULT_CHECK_INTERVAL};
