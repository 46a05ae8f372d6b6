//! Configuration for the payroll service.

use crate::queue::{QueueConfig, RetryPolicy, WorkerConfig};
use chrono::FixedOffset;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on.
    pub bind_addr: SocketAddr,
    /// SQLite database holding payroll data and queued jobs.
    pub database_path: PathBuf,
    /// Optional JSON file of reference data loaded into the database
    /// at startup.
    pub data_file: Option<PathBuf>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// Offset in which month boundaries are drawn.
    pub utc_offset: FixedOffset,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the value of
    /// a variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parse_or(&lookup, "PAYROLL_BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let database_path = lookup("PAYROLL_DATABASE_PATH")
            .filter(|p| !p.trim().is_empty())
            .map_or_else(|| PathBuf::from(".data/payroll.db"), PathBuf::from);
        let data_file = lookup("PAYROLL_DATA_FILE").map(PathBuf::from);

        let defaults = QueueConfig::default();
        let attempts: u32 = parse_or(&lookup, "PAYROLL_QUEUE_ATTEMPTS", defaults.retry.attempts)?;
        if attempts == 0 {
            return Err(ConfigError::Invalid("PAYROLL_QUEUE_ATTEMPTS"));
        }
        let backoff_ms: u64 = parse_or(
            &lookup,
            "PAYROLL_QUEUE_BACKOFF_MS",
            defaults.retry.backoff.as_millis() as u64,
        )?;
        let queue = QueueConfig {
            name: lookup("PAYROLL_QUEUE_NAME").unwrap_or(defaults.name),
            retry: RetryPolicy {
                attempts,
                backoff: Duration::from_millis(backoff_ms),
            },
            ..defaults
        };

        let concurrency: usize = parse_or(
            &lookup,
            "PAYROLL_QUEUE_CONCURRENCY",
            WorkerConfig::default().concurrency,
        )?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid("PAYROLL_QUEUE_CONCURRENCY"));
        }

        let offset_minutes: i32 = parse_or(&lookup, "PAYROLL_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::Invalid("PAYROLL_UTC_OFFSET_MINUTES"))?;

        Ok(Self {
            bind_addr,
            database_path,
            data_file,
            queue,
            worker: WorkerConfig { concurrency },
            utc_offset,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but its value cannot be used.
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
