mod config;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod metrics;
mod pool;
mod process;
mod runner;

use anyhow::Context;
use codo_common::config::{EngineConfig, SandboxKind};
use codo_common::problems::RedisProblemStore;
use codo_common::queue::{QueueSettings, RedisQueue};
use codo_common::redis;
use codo_common::store::RedisStore;
use config::LanguageConfigManager;
use engine::Sandbox;
use executor::JudgeContext;
use pool::{PoolSettings, WorkerPool};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Codo Worker booting...");

    let config = EngineConfig::from_env().context("Invalid worker configuration")?;

    // Load language configurations
    let languages = LanguageConfigManager::load(Path::new(&config.languages_path)).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        error!("Make sure {} exists", config.languages_path);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let sandbox: Arc<dyn Sandbox> = match config.sandbox {
        SandboxKind::Docker => Arc::new(docker::DockerSandbox::new(languages)?),
        SandboxKind::Process => {
            let sandbox = process::ProcessSandbox::new(languages);
            warn!(
                network_isolated = sandbox.network_isolated(),
                "Process sandbox selected: memory limits rely on rlimits and runtime flags"
            );
            Arc::new(sandbox)
        }
    };
    info!(sandbox = %config.sandbox, workers = config.workers, "Sandbox ready");

    // Connect to Redis
    let conn = redis::connect(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let queue = RedisQueue::connect(
        &config.redis_url,
        QueueSettings {
            ceiling: config.queue_ceiling,
            max_attempts: config.max_attempts,
            lease_ttl: config.lease_ttl,
        },
    )
    .await
    .context("Failed to open submission queue")?;
    info!("Connected to Redis: {}", config.redis_url);

    let ctx = Arc::new(JudgeContext {
        store: Arc::new(RedisStore::new(conn.clone())),
        queue: Arc::new(queue),
        problems: Arc::new(RedisProblemStore::new(conn)),
        sandbox,
        default_limits: config.default_limits,
    });

    let metrics_addr = config.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(&metrics_addr).await {
            error!("Metrics server stopped: {:#}", e);
        }
    });

    let pool = WorkerPool::new(
        ctx,
        PoolSettings {
            workers: config.workers,
            poll_interval: Duration::from_secs(1),
            lease_ttl: config.lease_ttl,
            reaper_interval: config.reaper_interval,
        },
    );

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = pool.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, draining in-flight submissions...");
            shutdown_tx.send(true)?;
            run.await?;
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
