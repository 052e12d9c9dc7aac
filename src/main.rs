//! Replay relay server
//!
//! Real-time session-replay broker handling:
//! - Tracker and viewer WebSocket connections with heartbeat enforcement
//! - In-memory session registry with bounded event buffers
//! - Write-behind batched persistence to Postgres
//! - HTTP query surface over live and persisted sessions

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

use api::{router, AppState};
use batcher::Batcher;
use broker::{ConnectionHub, SessionRegistry};
use relay_core::RelayConfig;
use store::SessionStore;
use telemetry::{health, init_tracing_from_env};
use worker::WorkerScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing_from_env();

    info!("Starting replay relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = RelayConfig::load().context("Failed to load configuration")?;
    info!(
        host = %config.host,
        port = config.port,
        db_host = %config.store.host,
        db_name = %config.store.database,
        "Loaded configuration"
    );

    // Connect to Postgres and apply the schema
    let store = SessionStore::connect(config.store.clone())
        .await
        .context("Failed to connect to Postgres")?;
    store::schema::init_schema(&store)
        .await
        .context("Failed to initialize store schema")?;

    if store::health::check_connection(&store).await {
        health().database.set_healthy();
        info!("Postgres connection: healthy");
    } else {
        health().database.set_unhealthy("Connection failed");
        error!("Postgres connection: unhealthy");
    }

    // Start the write-behind batcher
    let batcher = Arc::new(Batcher::new(
        Arc::new(store.clone()),
        config.batcher.clone(),
    ));
    let flush_handle = batcher.clone().start_flush_task();
    health().batcher.set_healthy();

    // Session registry and connection hub
    let registry = Arc::new(SessionRegistry::new(
        batcher.clone(),
        config.broker.max_events_per_session,
    ));
    let hub = ConnectionHub::new(registry.clone(), store.clone(), config.broker.clone());
    let heartbeat_handle = hub.start_heartbeat_task();

    // Start background cleanup workers
    let scheduler = Arc::new(WorkerScheduler::new(
        config.worker.clone(),
        registry.clone(),
        store.clone(),
    ));
    let worker_handles = scheduler.start();

    // Create application state and router
    let state = AppState::new(hub.clone(), registry.clone(), store.clone());
    let app = router(state);

    // Start HTTP server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    // Run server with graceful shutdown. The hub is signalled inside the
    // shutdown future so open WebSockets close and serve can return.
    let shutdown_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.shutdown();
        })
        .await
        .context("Server error")?;

    // Teardown order: hub, workers, batcher (drain), store
    info!("Shutting down...");

    heartbeat_handle.abort();
    for handle in worker_handles {
        handle.abort();
    }
    flush_handle.abort();

    if let Err(e) = batcher.shutdown().await {
        error!("Failed to drain batcher: {}", e);
    }
    store.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
