//! Realm game server.
//!
//! Wires the stores, the tick scheduler and the messaging hub together and
//! serves the `WebSocket` delivery endpoint until `Ctrl-C`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `realm-config.yaml` (or `$REALM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` and run migrations
//! 4. Connect to `Dragonfly` (channel journal)
//! 5. Create the messaging hub and start broker sync (degrades to
//!    local-only chat if NATS is unreachable)
//! 6. Spawn the tick scheduler
//! 7. Serve HTTP
//!
//! # Shutdown Sequence
//!
//! 1. Stop the scheduler and wait up to `tick.shutdown_grace_secs`
//! 2. Stop broker sync
//! 3. Drain the HTTP server
//! 4. Close the store connections

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use realm_core::config::{GameConfig, LogFormat, LoggingConfig};
use realm_core::events::EventSink;
use realm_core::scheduler::TickScheduler;
use realm_db::{DragonflyPool, PoolSettings, PostgresPool};
use realm_hub::{MessagingHub, NatsConnector, SyncManager, SyncOptions};
use realm_server::error::ServerError;
use realm_server::router::build_router;
use realm_server::state::AppState;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, a store connection, or the HTTP
/// listener fails during startup.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, config_path, found) = load_config()?;
    init_logging(&config.logging);

    if found {
        info!(path = %config_path.display(), "Configuration loaded");
    } else {
        info!(path = %config_path.display(), "Config file not found, using defaults");
    }
    info!(
        world = config.world.name,
        world_type = ?config.world.world_type,
        sweep_interval_secs = config.tick.sweep_interval_secs,
        battle_interval_secs = config.tick.battle_interval_secs,
        "realm-server starting"
    );

    run(Arc::new(config)).await?;
    info!("realm-server shutdown complete");
    Ok(())
}

/// Config path from `$REALM_CONFIG`, falling back to `realm-config.yaml`.
fn load_config() -> Result<(GameConfig, PathBuf, bool), ServerError> {
    let path = std::env::var("REALM_CONFIG")
        .map_or_else(|_| PathBuf::from("realm-config.yaml"), PathBuf::from);
    if path.exists() {
        let config = GameConfig::from_file(&path)?;
        Ok((config, path, true))
    } else {
        // Still honour environment overrides for the connection settings.
        let config = GameConfig::parse("")?;
        Ok((config, path, false))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `logging.level`.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Bring every subsystem up, serve until `Ctrl-C`, then tear down in order.
async fn run(config: Arc<GameConfig>) -> Result<(), ServerError> {
    let infra = &config.infrastructure;

    // Stores.
    let store = Arc::new(PostgresPool::connect(&infra.postgres_url, PoolSettings::default()).await?);
    store.run_migrations().await?;
    let journal = Arc::new(DragonflyPool::connect(&infra.dragonfly_url).await?);

    // Messaging hub and broker sync.
    let hub = Arc::new(MessagingHub::new(config.chat.clone()));
    let sync = SyncManager::new(
        Arc::clone(&hub),
        NatsConnector::new(infra.nats_url.as_str()),
        Arc::clone(&journal),
        SyncOptions::from_config(&config),
    );
    if let Err(e) = sync.start().await {
        warn!(error = %e, "Broker sync unavailable, chat is local-only");
    }

    // Tick scheduler.
    let events: Arc<dyn EventSink> = Arc::<MessagingHub>::clone(&hub);
    let scheduler = Arc::new(TickScheduler::new(
        Arc::clone(&store),
        Arc::clone(&config),
        events,
    ));
    let scheduler_task = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };
    info!("Tick scheduler started");

    // HTTP.
    let addr: SocketAddr = format!("{}:{}", infra.http_host, infra.http_port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))?;
    let router = build_router(Arc::new(AppState::new(Arc::clone(&hub), sync.watch())));
    let (http_stop, http_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                http_stopped.await.unwrap_or_default();
            })
            .await
    });
    info!(%addr, "HTTP server listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");

    // 1. Scheduler finishes the item in hand.
    let grace = Duration::from_secs(config.tick.shutdown_grace_secs);
    scheduler.stop();
    match tokio::time::timeout(grace, scheduler_task).await {
        Ok(Ok(())) => info!("Tick scheduler stopped"),
        Ok(Err(e)) => warn!(error = %e, "Tick scheduler task failed"),
        Err(_) => warn!(?grace, "Tick scheduler did not stop within grace period"),
    }

    // 2. Broker sync.
    sync.stop().await;

    // 3. HTTP drain. Upgraded WebSocket connections are not waited on past the grace period.
    http_stop.send(()).unwrap_or_default();
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Ok(()))) => info!("HTTP server drained"),
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server error during drain"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => warn!(?grace, "HTTP server did not drain within grace period"),
    }

    // 4. Stores.
    if let Err(e) = journal.close().await {
        warn!(error = %e, "Dragonfly close failed");
    }
    store.close().await;
    Ok(())
}
