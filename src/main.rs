mod config;
mod db;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::{create_pool, run_migrations, ChannelStore, MemoryStore, PgChannelStore};
use crate::services::{
    gateway::{spawn_reaper, Gateway},
    progress::SyncTracker,
    redis::RedisService,
    refresher::start_refresh_task,
    sync::SyncEngine,
    token_cache::SessionCaches,
};

/// `DATABASE_URL` value that selects the in-process store
const MEMORY_STORE: &str = "memory";

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn ChannelStore>,
    pub redis: Option<RedisService>,
    pub gateway: Arc<Gateway>,
    pub sync: Arc<SyncEngine>,
    pub tracker: Arc<SyncTracker>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn ChannelStore>,
        redis: Option<RedisService>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let caches = Arc::new(SessionCaches::new(&config));

        let gateway = Gateway::new(config.clone(), store.clone(), caches.clone())
            .context("failed to build gateway HTTP clients")?;
        let sync = SyncEngine::new(config.clone(), store.clone(), caches)
            .context("failed to build sync HTTP client")?;
        let tracker = SyncTracker::new(redis.clone());

        Ok(Self {
            store,
            redis,
            gateway: Arc::new(gateway),
            sync: Arc::new(sync),
            tracker: Arc::new(tracker),
            start_time: Instant::now(),
        })
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ChannelStore>> {
    if config.database_url == MEMORY_STORE {
        tracing::warn!("DATABASE_URL=memory, channels are kept in process only");
        return Ok(Arc::new(MemoryStore::new()));
    }

    // Initialize PostgreSQL connection pool
    let pool = create_pool(config)
        .await
        .context("failed to connect to PostgreSQL")?;
    tracing::info!("PostgreSQL connected");

    // Run database migrations
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;
    tracing::info!("Database migrations completed");

    Ok(Arc::new(PgChannelStore::new(pool)))
}

/// Redis only mirrors sync progress, so a failed connection is not fatal
async fn open_redis(config: &Config) -> Option<RedisService> {
    let url = config.redis_url.as_deref()?;
    match RedisService::new(url).await {
        Ok(redis) => {
            tracing::info!("Redis connected");
            Some(redis)
        }
        Err(e) => {
            tracing::warn!("Redis unavailable, progress mirror disabled: {:#}", e);
            None
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken, gateway: Arc<Gateway>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
    // open streams would otherwise hold the server open indefinitely
    gateway.close_all();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "channel_gateway=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Load configuration
    let config = Config::from_env();
    let port = config.port;

    tracing::info!("Starting Channel Gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app_env);

    let store = open_store(&config).await?;
    let redis = open_redis(&config).await;

    let reaper_interval = Duration::from_secs(config.reaper_interval_secs.max(1));
    let refresh_interval = config.refresh_interval_secs;
    let state = Arc::new(AppState::new(config, store, redis)?);

    // Background tasks stop on the shutdown token
    let shutdown = CancellationToken::new();
    let reaper = spawn_reaper(state.gateway.clone(), reaper_interval, shutdown.clone());
    tracing::info!("Stream reaper started (every {}s)", reaper_interval.as_secs());

    let refresher = tokio::spawn(start_refresh_task(
        state.sync.clone(),
        state.tracker.clone(),
        refresh_interval,
        shutdown.clone(),
    ));

    let app = routes::router(state.clone());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone(), state.gateway.clone()))
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(reaper, refresher);
    tracing::info!("Server stopped");

    Ok(())
}
