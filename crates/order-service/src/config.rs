//! Application configuration loaded from environment variables.

use std::time::Duration;

use common::MAX_SHARDS;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URLS lists {urls} databases but SHARD_COUNT is {shards}")]
    ShardCountMismatch { urls: usize, shards: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Service configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address of the ops endpoints (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `SHARD_COUNT`: number of order partitions (default 4)
/// - `DATABASE_URLS`: comma-separated, one per shard; unset selects the in-memory store
/// - `DB_MAX_CONNECTIONS`: pool size per shard (default 10)
/// - `WORKER_ID`: id generator worker (default 0)
/// - `PAYMENT_TIMEOUT_SECS` (900), `WHEEL_TICK_MS` (1000), `WHEEL_SLOTS` (512)
/// - `OUTBOX_POLL_MS` (500), `OUTBOX_BATCH_SIZE` (100), `REHYDRATE_GRACE_SECS` (30)
///
/// Unparseable or out-of-range values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub shard_count: u16,
    pub database_urls: Option<Vec<String>>,
    pub db_max_connections: u32,
    pub worker_id: u16,
    pub payment_timeout: Duration,
    pub wheel_tick: Duration,
    pub wheel_slots: usize,
    pub outbox_poll: Duration,
    pub outbox_batch_size: usize,
    pub rehydrate_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let shard_count = parsed("SHARD_COUNT")
            .filter(|n| (1..=u64::from(MAX_SHARDS)).contains(n))
            .map(|n| n as u16)
            .unwrap_or(defaults.shard_count);

        let database_urls = lookup("DATABASE_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty());
        if let Some(urls) = &database_urls {
            if urls.len() != usize::from(shard_count) {
                return Err(ConfigError::ShardCountMismatch {
                    urls: urls.len(),
                    shards: shard_count,
                });
            }
        }

        let log_format = match lookup("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            Some(format) if format == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            shard_count,
            database_urls,
            db_max_connections: parsed("DB_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.db_max_connections),
            worker_id: parsed("WORKER_ID")
                .filter(|n| *n < u64::from(common::MAX_WORKERS))
                .map(|n| n as u16)
                .unwrap_or(defaults.worker_id),
            payment_timeout: parsed("PAYMENT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.payment_timeout),
            wheel_tick: parsed("WHEEL_TICK_MS")
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.wheel_tick),
            wheel_slots: parsed("WHEEL_SLOTS")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.wheel_slots),
            outbox_poll: parsed("OUTBOX_POLL_MS")
                .filter(|n| *n > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.outbox_poll),
            outbox_batch_size: parsed("OUTBOX_BATCH_SIZE")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.outbox_batch_size),
            rehydrate_grace: parsed("REHYDRATE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rehydrate_grace),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            shard_count: 4,
            database_urls: None,
            db_max_connections: 10,
            worker_id: 0,
            payment_timeout: Duration::from_secs(15 * 60),
            wheel_tick: Duration::from_millis(1000),
            wheel_slots: 512,
            outbox_poll: Duration::from_millis(500),
            outbox_batch_size: 100,
            rehydrate_grace: Duration::from_secs(30),
        }
    }
}
