//! Karbos worker node.
//!
//! Connects to Postgres, Redis, and the Docker daemon, then runs the
//! worker pool, the delayed-job promoter, and the liveness heartbeat until
//! a termination signal arrives. Shutdown drains in-flight containers
//! within the configured grace window before cancelling the daemons.

use karbos::config::Config;
use karbos::executor::{ContainerExecutor, DockerExecutor};
use karbos::queue::{JobQueue, RedisQueue};
use karbos::store::{JobStore, PgJobStore};
use karbos::worker::{Heartbeat, PoolConfig, Promoter, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "worker node failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!(version = karbos::VERSION, "karbos worker node starting");

    let config = Config::from_env()?;
    info!(pool_size = config.worker.pool_size, "configuration loaded");

    // Postgres.
    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database.url)
        .await?;
    info!("connected to postgres");

    // Redis.
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisQueue::connect_with_keys(
            &config.redis.url(),
            &config.redis.immediate_key,
            &config.redis.delayed_key,
        )
        .await?,
    );

    // Docker.
    let executor = DockerExecutor::connect()?;
    executor.ping().await?;
    info!("connected to docker daemon");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pg_pool));

    let pool = WorkerPool::new(
        PoolConfig {
            size: config.worker.pool_size,
            poll_interval: config.worker.poll_interval,
            job_timeout: config.worker.job_timeout,
            limits: karbos::executor::ResourceLimits {
                memory_bytes: config.executor.memory_limit,
                cpu_quota: config.executor.cpu_quota,
            },
        },
        Arc::clone(&queue),
        store,
        Arc::new(executor),
    );

    // Auxiliary daemons share one shutdown token, cancelled after drain.
    let daemons = CancellationToken::new();

    let promoter = Promoter::new(Arc::clone(&queue)).with_check_interval(config.promoter.interval);
    let promoter_handle = tokio::spawn(promoter.run(daemons.clone()));

    let heartbeat = Heartbeat::new(Arc::clone(&queue), pool.process_id().to_string());
    let heartbeat_handle = tokio::spawn(heartbeat.run(daemons.clone()));

    pool.start();
    info!(worker = %pool.process_id(), "worker node running, press ctrl-c to stop");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    // Drain within the operator's grace window; past it, cancel in-flight
    // work through the pool's own token.
    if tokio::time::timeout(config.worker.drain_budget, pool.stop()).await.is_err() {
        warn!(
            budget_secs = config.worker.drain_budget.as_secs(),
            "drain budget exceeded, cancelling outstanding work"
        );
        pool.shutdown_token().cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), pool.stop()).await;
    }

    daemons.cancel();
    let _ = promoter_handle.await;
    let _ = heartbeat_handle.await;

    info!("worker node stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
