//! Container runtime abstraction.
//!
//! The worker pool runs jobs through the [`ContainerExecutor`] capability:
//! pull the image if absent, run the container to completion under a
//! resource ceiling and a deadline, hand back the exit code and captured
//! output. Cleanup is the implementation's problem and is guaranteed on
//! every exit path.

mod docker;

pub use docker::DockerExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Delimiter between stdout and stderr in combined output.
pub const STDERR_DELIMITER: &str = "\n--- STDERR ---\n";

/// Default cleanup window, independent of the execution deadline.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from container execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("failed to create container: {0}")]
    CreateFailed(String),
    #[error("failed to start container: {0}")]
    StartFailed(String),
    #[error("log stream broken: {0}")]
    LogStreamBroken(String),
    #[error("execution canceled")]
    Canceled,
}

/// Resource ceiling applied to every container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes (default 512 MiB, no swap on top).
    pub memory_bytes: i64,
    /// CPU quota in microseconds per 100ms period (default 50000, i.e.
    /// half of one core).
    pub cpu_quota: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 50_000,
        }
    }
}

/// Outcome of a container run that reached an exit code.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// The container's exit code, verbatim.
    pub exit_code: i64,
    /// Combined captured output; stdout and stderr are separated by
    /// [`STDERR_DELIMITER`] when both are non-empty.
    pub output: String,
    /// Wall-clock runtime in whole seconds.
    pub runtime_secs: i64,
    pub started_at: DateTime<Utc>,
}

/// Interleaves captured stdout and stderr with a single delimiter.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{}{}{}", stdout, STDERR_DELIMITER, stderr),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (true, true) => String::new(),
    }
}

/// Capability set for the container runtime.
#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Pulls the image if it is not present locally. Idempotent.
    async fn ensure_image(&self, image: &str) -> Result<(), ExecutorError>;

    /// Creates and runs a container to completion, or until `deadline`
    /// elapses or `cancel` fires. The container is removed on every exit
    /// path within a bounded cleanup window separate from `deadline`.
    async fn run(
        &self,
        image: &str,
        command: Option<&[String]>,
        limits: &ResourceLimits,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Runtime health check.
    async fn ping(&self) -> Result<(), ExecutorError>;
}
