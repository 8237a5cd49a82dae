//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_HTTP_PORT, MAX_FILE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./courier.db`
    pub database_path: PathBuf,

    /// Directory where attachment bytes are stored, sharded by hash prefix.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    /// Default: 50 MiB
    pub max_blob_size: usize,

    /// How long a push to one connection may wait before that connection is
    /// treated as dead.
    /// Env: `PUSH_TIMEOUT_MS`
    /// Default: 2000
    pub push_timeout: Duration,

    /// Outbound frames buffered per connection.
    /// Env: `OUTBOUND_QUEUE`
    /// Default: 256
    pub outbound_queue: usize,

    /// Idle time after which a connection is evicted by the sweeper.
    /// Env: `STALE_CONNECTION_SECS`
    /// Default: 120
    pub stale_after: Duration,

    /// Interval between stale-connection sweeps.
    /// Env: `CONNECTION_SWEEP_SECS`
    /// Default: 30
    pub connection_sweep_interval: Duration,

    /// Interval between orphaned-file reclaim runs.
    /// Env: `RECLAIM_INTERVAL_SECS`
    /// Default: 600
    pub reclaim_interval: Duration,

    /// Minimum time a file must sit at zero references before its bytes are
    /// deleted.
    /// Env: `RECLAIM_GRACE_SECS`
    /// Default: 3600
    pub reclaim_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./courier.db"),
            blob_storage_path: PathBuf::from("./blobs"),
            max_blob_size: MAX_FILE_SIZE,
            push_timeout: Duration::from_millis(2000),
            outbound_queue: 256,
            stale_after: Duration::from_secs(120),
            connection_sweep_interval: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(600),
            reclaim_grace: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Some(parsed) = parse_or_warn::<SocketAddr>("HTTP_ADDR", &addr) {
                config.http_addr = parsed;
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("MAX_BLOB_SIZE") {
            if let Some(n) = parse_or_warn::<usize>("MAX_BLOB_SIZE", &val) {
                config.max_blob_size = n;
            }
        }

        if let Some(val) = lookup("PUSH_TIMEOUT_MS") {
            if let Some(ms) = parse_or_warn::<u64>("PUSH_TIMEOUT_MS", &val) {
                config.push_timeout = Duration::from_millis(ms);
            }
        }

        if let Some(val) = lookup("OUTBOUND_QUEUE") {
            match parse_or_warn::<usize>("OUTBOUND_QUEUE", &val) {
                Some(0) => tracing::warn!("OUTBOUND_QUEUE must be positive, using default"),
                Some(n) => config.outbound_queue = n,
                None => {}
            }
        }

        let secs = [
            ("STALE_CONNECTION_SECS", &mut config.stale_after),
            ("CONNECTION_SWEEP_SECS", &mut config.connection_sweep_interval),
            ("RECLAIM_INTERVAL_SECS", &mut config.reclaim_interval),
            ("RECLAIM_GRACE_SECS", &mut config.reclaim_grace),
        ];
        for (key, slot) in secs {
            if let Some(val) = lookup(key) {
                if let Some(n) = parse_or_warn::<u64>(key, &val) {
                    *slot = Duration::from_secs(n);
                }
            }
        }

        // Tokio intervals panic on a zero period.
        if config.connection_sweep_interval.is_zero() {
            config.connection_sweep_interval = Self::default().connection_sweep_interval;
        }
        if config.reclaim_interval.is_zero() {
            config.reclaim_interval = Self::default().reclaim_interval;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "Invalid value, using default");
            None
        }
    }
}
