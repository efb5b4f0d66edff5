//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::pipeline::ReadModelSyncMode;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Ring capacity; must be a power of two
    pub ring_capacity: usize,

    /// Snapshot every N ring sequences
    pub snapshot_threshold: u64,

    /// Snapshots retained per account
    pub snapshot_retain_count: u32,

    /// Projector buffer size trigger
    pub projector_batch_size: usize,

    /// Projector time trigger
    pub projector_flush_period: Duration,

    /// Watcher scan period
    pub watcher_period: Duration,

    /// INIT rows older than this are orphans
    pub watcher_timeout_seconds: i64,

    /// Backward scan bound for the watcher
    pub watcher_scan_depth: usize,

    /// Bound on aggregate replay reads
    pub aggregate_read_timeout: Duration,

    /// Persistent subscription in-flight buffer
    pub subscription_buffer_size: usize,

    /// Server-side redelivery ceiling
    pub subscription_max_retries: u32,

    /// Unacked deliveries retry after this long
    pub subscription_ack_timeout: Duration,

    /// Which component owns the `accounts` read model
    pub read_model_sync: ReadModelSyncMode,

    /// Days of idempotency history to keep
    pub idempotency_retention_days: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_var("DATABASE_MAX_CONNECTIONS", "10")?;
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_var("PORT", "3000")?;

        let ring_capacity: usize = parse_var("RING_CAPACITY", "1024")?;
        if !ring_capacity.is_power_of_two() {
            return Err(ConfigError::InvalidValue("RING_CAPACITY"));
        }

        let snapshot_threshold: u64 = parse_var("SNAPSHOT_THRESHOLD", "100")?;
        if snapshot_threshold == 0 {
            return Err(ConfigError::InvalidValue("SNAPSHOT_THRESHOLD"));
        }

        let read_model_sync = match env::var("READ_MODEL_SYNC")
            .unwrap_or_else(|_| "projector".to_string())
            .as_str()
        {
            "projector" => ReadModelSyncMode::Projector,
            "pipeline" => ReadModelSyncMode::Pipeline,
            _ => return Err(ConfigError::InvalidValue("READ_MODEL_SYNC")),
        };

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            ring_capacity,
            snapshot_threshold,
            snapshot_retain_count: parse_var("SNAPSHOT_RETAIN_COUNT", "2")?,
            projector_batch_size: parse_var("PROJECTOR_BATCH_SIZE", "500")?,
            projector_flush_period: Duration::from_secs(parse_var("PROJECTOR_FLUSH_SECS", "3")?),
            watcher_period: Duration::from_secs(parse_var("WATCHER_PERIOD_SECS", "60")?),
            watcher_timeout_seconds: parse_var("WATCHER_TIMEOUT_SECS", "30")?,
            watcher_scan_depth: parse_var("WATCHER_SCAN_DEPTH", "2000")?,
            aggregate_read_timeout: Duration::from_secs(parse_var(
                "AGGREGATE_READ_TIMEOUT_SECS",
                "5",
            )?),
            subscription_buffer_size: parse_var("SUBSCRIPTION_BUFFER_SIZE", "50")?,
            subscription_max_retries: parse_var("SUBSCRIPTION_MAX_RETRIES", "10")?,
            subscription_ack_timeout: Duration::from_secs(parse_var(
                "SUBSCRIPTION_ACK_TIMEOUT_SECS",
                "10",
            )?),
            read_model_sync,
            idempotency_retention_days: parse_var("IDEMPOTENCY_RETENTION_DAYS", "30")?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test to avoid
    // interleaving.
    #[test]
    fn test_defaults_and_validation() {
        env::set_var("DATABASE_URL", "postgres://localhost/ledger");
        env::remove_var("RING_CAPACITY");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ring_capacity, 1024);
        assert_eq!(config.snapshot_threshold, 100);
        assert_eq!(config.snapshot_retain_count, 2);
        assert_eq!(config.projector_batch_size, 500);
        assert_eq!(config.projector_flush_period, Duration::from_secs(3));
        assert_eq!(config.watcher_period, Duration::from_secs(60));
        assert_eq!(config.watcher_timeout_seconds, 30);
        assert_eq!(config.watcher_scan_depth, 2000);
        assert_eq!(config.aggregate_read_timeout, Duration::from_secs(5));
        assert_eq!(config.subscription_buffer_size, 50);
        assert_eq!(config.subscription_max_retries, 10);
        assert_eq!(config.subscription_ack_timeout, Duration::from_secs(10));
        assert_eq!(config.read_model_sync, ReadModelSyncMode::Projector);

        env::set_var("RING_CAPACITY", "1000");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue("RING_CAPACITY"))
        ));

        env::set_var("RING_CAPACITY", "64");
        env::set_var("READ_MODEL_SYNC", "pipeline");
        let config = Config::from_env().unwrap();
        assert_eq!(config.ring_capacity, 64);
        assert_eq!(config.read_model_sync, ReadModelSyncMode::Pipeline);

        env::set_var("READ_MODEL_SYNC", "both");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue("READ_MODEL_SYNC"))
        ));

        env::remove_var("READ_MODEL_SYNC");
        env::remove_var("RING_CAPACITY");
        env::remove_var("DATABASE_URL");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnv("DATABASE_URL"))
        ));
    }
}
