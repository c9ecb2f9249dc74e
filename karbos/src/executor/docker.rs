//! Docker Engine executor.
//!
//! Containers are created with `AutoRemove` off so logs can be collected
//! after exit; removal is forced in [`cleanup`](DockerExecutor::cleanup),
//! which runs on every exit path under its own timeout so a hung daemon
//! cannot hold a worker slot past the cleanup window.

use super::{
    combine_output, ContainerExecutor, ExecutionResult, ExecutorError, ResourceLimits,
    DEFAULT_CLEANUP_TIMEOUT,
};
use async_trait::async_trait;
use bollard::container::{Config, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// [`ContainerExecutor`] over the Docker Engine API.
pub struct DockerExecutor {
    docker: Docker,
    cleanup_timeout: Duration,
}

impl DockerExecutor {
    /// Connects using the environment's Docker endpoint.
    pub fn connect() -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::RuntimeUnreachable(e.to_string()))?;
        Ok(Self {
            docker,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        })
    }

    /// Overrides the cleanup window.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Waits for exit, then collects logs. Split out so `run` can funnel
    /// every return path through cleanup.
    async fn execute(
        &self,
        container_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(i64, String), ExecutorError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutorError::StartFailed(e.to_string()))?;

        let mut wait_stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutorError::Canceled),
            waited = tokio::time::timeout(deadline, wait_stream.next()) => waited,
        };

        let exit_code = match waited {
            // Deadline elapsed with the container still running.
            Err(_) => return Err(ExecutorError::Canceled),
            Ok(None) => {
                return Err(ExecutorError::LogStreamBroken(
                    "wait stream ended without a status".to_string(),
                ))
            }
            Ok(Some(Ok(status))) => status.status_code,
            // Non-zero exits surface as a wait error carrying the code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(ExecutorError::RuntimeUnreachable(e.to_string())),
        };

        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
                Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                Ok(_) => {}
                Err(e) => return Err(ExecutorError::LogStreamBroken(e.to_string())),
            }
        }

        Ok((exit_code, combine_output(&stdout, &stderr)))
    }

    /// Force-removes the container under the cleanup window. Failures are
    /// logged, never propagated: the execution outcome already happened.
    async fn cleanup(&self, container_id: &str) {
        let remove = self.docker.remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );

        match tokio::time::timeout(self.cleanup_timeout, remove).await {
            Ok(Ok(())) => debug!(container_id = container_id, "container removed"),
            Ok(Err(e)) => warn!(container_id = container_id, error = %e, "container removal failed"),
            Err(_) => warn!(container_id = container_id, "container removal timed out"),
        }
    }
}

#[async_trait]
impl ContainerExecutor for DockerExecutor {
    async fn ensure_image(&self, image: &str) -> Result<(), ExecutorError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image = image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = pull.next().await {
            progress.map_err(|e| ExecutorError::ImageUnavailable(e.to_string()))?;
        }

        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        command: Option<&[String]>,
        limits: &ResourceLimits,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started_at = Utc::now();
        let started = Instant::now();

        self.ensure_image(image).await?;

        let config = Config {
            image: Some(image.to_string()),
            cmd: command.map(|argv| argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                memory: Some(limits.memory_bytes),
                memory_swap: Some(limits.memory_bytes),
                cpu_quota: Some(limits.cpu_quota),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| ExecutorError::CreateFailed(e.to_string()))?;
        let container_id = created.id;

        let outcome = self.execute(&container_id, deadline, cancel).await;
        self.cleanup(&container_id).await;

        let (exit_code, output) = outcome?;
        Ok(ExecutionResult {
            exit_code,
            output,
            runtime_secs: started.elapsed().as_secs() as i64,
            started_at,
        })
    }

    async fn ping(&self) -> Result<(), ExecutorError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ExecutorError::RuntimeUnreachable(e.to_string()))
    }
}
