//! Engine configuration module.
//!
//! Parses configuration from environment variables for the todos engine.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TODOS_REGISTRY_COLLECTION` | No | `userdata` | Collection holding one row per todo list |
//! | `TODOS_TXN_MAX_ATTEMPTS` | No | 3 | Commit attempts per list write (1-10) |
//! | `TODOS_TXN_RETRY_DELAY_MS` | No | 300 | Initial delay between conflicting commits |
//! | `TODOS_EVENT_CAPACITY` | No | 1000 | Capacity of the list event broadcast channel |

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Default name of the registry collection.
pub const DEFAULT_REGISTRY_COLLECTION: &str = "userdata";

/// Default number of commit attempts for a bulk completion.
const DEFAULT_TXN_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first transaction retry.
const DEFAULT_TXN_RETRY_DELAY_MS: u64 = 300;

/// Default broadcast capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Minimum allowed commit attempts.
const MIN_TXN_ATTEMPTS: u32 = 1;

/// Maximum allowed commit attempts.
const MAX_TXN_ATTEMPTS: u32 = 10;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name of the top-level collection listing every todo list.
    pub registry_collection: String,

    /// Maximum commit attempts for one optimistic list write.
    pub txn_max_attempts: u32,

    /// Delay before the first retry; doubled after each conflict.
    pub txn_retry_delay: Duration,

    /// Capacity of the list event broadcast channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_collection: DEFAULT_REGISTRY_COLLECTION.to_string(),
            txn_max_attempts: DEFAULT_TXN_MAX_ATTEMPTS,
            txn_retry_delay: Duration::from_millis(DEFAULT_TXN_RETRY_DELAY_MS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an unparsable or
    /// out-of-range value.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use todos_engine::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Registry collection: {}", config.registry_collection);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let registry_collection = match env::var("TODOS_REGISTRY_COLLECTION") {
            Ok(name) if name.trim().is_empty() => {
                return Err(ConfigError::InvalidValue {
                    key: "TODOS_REGISTRY_COLLECTION".to_string(),
                    message: "collection name cannot be empty".to_string(),
                });
            }
            Ok(name) => name.trim().to_string(),
            Err(_) => DEFAULT_REGISTRY_COLLECTION.to_string(),
        };

        let txn_max_attempts = parse_txn_max_attempts()?;
        let txn_retry_delay = Duration::from_millis(parse_u64_env(
            "TODOS_TXN_RETRY_DELAY_MS",
            DEFAULT_TXN_RETRY_DELAY_MS,
        )?);
        let event_capacity = parse_event_capacity()?;

        let config = Self {
            registry_collection,
            txn_max_attempts,
            txn_retry_delay,
            event_capacity,
        };

        debug!(
            registry_collection = %config.registry_collection,
            txn_max_attempts = config.txn_max_attempts,
            txn_retry_delay_ms = config.txn_retry_delay.as_millis() as u64,
            event_capacity = config.event_capacity,
            "Loaded engine configuration"
        );

        Ok(config)
    }
}

/// Parse an unsigned integer environment variable, falling back to `default`.
fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                message: e.to_string(),
            }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse `TODOS_TXN_MAX_ATTEMPTS`, enforcing the 1-10 range.
fn parse_txn_max_attempts() -> Result<u32, ConfigError> {
    let attempts = parse_u64_env("TODOS_TXN_MAX_ATTEMPTS", u64::from(DEFAULT_TXN_MAX_ATTEMPTS))?;
    match u32::try_from(attempts) {
        Ok(n) if (MIN_TXN_ATTEMPTS..=MAX_TXN_ATTEMPTS).contains(&n) => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: "TODOS_TXN_MAX_ATTEMPTS".to_string(),
            message: format!(
                "must be between {MIN_TXN_ATTEMPTS} and {MAX_TXN_ATTEMPTS}, got {attempts}"
            ),
        }),
    }
}

/// Parse `TODOS_EVENT_CAPACITY`; a broadcast channel cannot have zero capacity.
fn parse_event_capacity() -> Result<usize, ConfigError> {
    let capacity = parse_u64_env("TODOS_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY as u64)?;
    match usize::try_from(capacity) {
        Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
            key: "TODOS_EVENT_CAPACITY".to_string(),
            message: "must be a positive integer".to_string(),
        }),
        Ok(n) => Ok(n),
    }
}
