//! Postgres client wrapper.

use relay_core::{Error, Result, StoreConfig};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Postgres-backed session store with connection pooling.
#[derive(Clone)]
pub struct SessionStore {
    pool: PgPool,
    config: StoreConfig,
}

impl SessionStore {
    /// Connects to Postgres and verifies the connection.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let pool = Self::pool_options(&config)
            .connect_with(Self::connect_options(&config))
            .await
            .map_err(|e| Error::database(format!("Failed to connect to Postgres: {}", e)))?;

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_connections = config.max_connections,
            "Connected to Postgres"
        );

        Ok(Self { pool, config })
    }

    /// Builds the store without establishing a connection.
    ///
    /// Connections are opened on first use; queries against an unreachable
    /// server fail per-call instead of at startup. Used by tests and by
    /// deployments that bring the database up after the relay.
    pub fn connect_lazy(config: StoreConfig) -> Self {
        let pool = Self::pool_options(&config).connect_lazy_with(Self::connect_options(&config));
        Self { pool, config }
    }

    fn pool_options(config: &StoreConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
    }

    fn connect_options(config: &StoreConfig) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
    }

    /// Returns the inner connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Closes the pool. Final step of graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Postgres pool closed");
    }
}

/// Maps a driver error into the relay's database error.
pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::database(e.to_string())
}
