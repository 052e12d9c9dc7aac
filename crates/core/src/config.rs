//! Relay configuration.
//!
//! One composed [`RelayConfig`] covers every component. Values come from
//! defaults, then an optional `config/default.toml`, then `RELAY__`-prefixed
//! environment variables, then the flat well-known keys (`PORT`, `DB_HOST`,
//! `BATCH_SIZE`, …) that deployments actually set.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Postgres connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub database: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Idle connection reap timeout, in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Connection acquire timeout, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "session_replay".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            database: default_db_name(),
            user: default_db_user(),
            password: String::new(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Write-behind queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Maximum entries drained per flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Interval between timed flushes, in milliseconds
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_interval_ms() -> u64 {
    5_000
}

impl BatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Queue depth at which producers flush synchronously instead of
    /// queueing further.
    pub fn pressure_threshold(&self) -> usize {
        self.batch_size * 2
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
        }
    }
}

/// Session registry and connection hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// In-memory event buffer cap per session
    #[serde(default = "default_max_events_per_session")]
    pub max_events_per_session: usize,
    /// Heartbeat sweep interval, in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_max_events_per_session() -> usize {
    1_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_events_per_session: default_max_events_per_session(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

/// Background worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Cleanup pass interval, in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Store-side retention for inactive sessions, in hours
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i32,
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

fn default_retention_hours() -> i32 {
    720
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            retention_hours: default_retention_hours(),
        }
    }
}

/// Composed relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub batcher: BatcherConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            batcher: BatcherConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from files and environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(config_err)?)
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("RELAY")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;

        let mut config: Self = config.try_deserialize().map_err(config_err)?;
        config.apply_flat_env();
        Ok(config)
    }

    /// The flat environment keys override everything.
    fn apply_flat_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("PORT") {
            self.port = port;
        }

        if let Ok(host) = std::env::var("DB_HOST") {
            self.store.host = host;
        }
        if let Some(port) = env_parse("DB_PORT") {
            self.store.port = port;
        }
        if let Ok(name) = std::env::var("DB_NAME") {
            self.store.database = name;
        }
        if let Ok(user) = std::env::var("DB_USER") {
            self.store.user = user;
        }
        if let Ok(password) = std::env::var("DB_PASSWORD") {
            self.store.password = password;
        }
        if let Some(max) = env_parse("DB_MAX_CONNECTIONS") {
            self.store.max_connections = max;
        }
        if let Some(ms) = env_parse("DB_IDLE_TIMEOUT") {
            self.store.idle_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("DB_CONNECTION_TIMEOUT") {
            self.store.connect_timeout_ms = ms;
        }

        if let Some(size) = env_parse("BATCH_SIZE") {
            self.batcher.batch_size = size;
        }
        if let Some(ms) = env_parse("BATCH_INTERVAL") {
            self.batcher.batch_interval_ms = ms;
        }

        if let Some(max) = env_parse("MAX_EVENTS_PER_SESSION") {
            self.broker.max_events_per_session = max;
        }
        if let Some(ms) = env_parse("HEARTBEAT_INTERVAL") {
            self.broker.heartbeat_interval_ms = ms;
        }

        if let Some(ms) = env_parse("SESSION_CLEANUP_INTERVAL") {
            self.worker.cleanup_interval_ms = ms;
        }
        if let Some(hours) = env_parse("SESSION_RETENTION_HOURS") {
            self.worker.retention_hours = hours;
        }
    }
}

fn config_err(e: config::ConfigError) -> Error {
    Error::config(e.to_string())
}

/// Parses a decimal environment variable, ignoring unset or malformed values.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
