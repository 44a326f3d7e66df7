mod handlers;
mod language_config;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use codo_common::config::EngineConfig;
use codo_common::problems::{ProblemStore, RedisProblemStore};
use codo_common::queue::{QueueSettings, RedisQueue, SubmissionQueue};
use codo_common::redis;
use codo_common::store::{RedisStore, SubmissionStore};
use language_config::LanguageRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    pub queue: Arc<dyn SubmissionQueue>,
    pub problems: Arc<dyn ProblemStore>,
    pub languages: LanguageRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Codo API booting...");

    let config = EngineConfig::from_env().context("Invalid API configuration")?;

    let languages = LanguageRegistry::load_from_file(&config.languages_path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Make sure {} exists", config.languages_path))?;
    info!("Enabled languages: {:?}", languages.enabled_languages());

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

    let state = Arc::new(AppState {
        store: Arc::new(RedisStore::new(conn.clone())),
        queue: Arc::new(queue),
        problems: Arc::new(RedisProblemStore::new(conn)),
        languages,
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_addr))?;

    info!("HTTP server listening on {}", config.api_addr);
    info!("Ready to accept submissions (queue ceiling {})", config.queue_ceiling);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received shutdown signal, closing listener");
            }
        })
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}
