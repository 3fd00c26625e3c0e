//! Centralized configuration for storage-smoke.
//!
//! All environment variables are loaded and validated at startup so a bad
//! value fails before any storage is created.

use std::env;
use std::fmt;

use domain::validate::validate_heartbeat;
use storage_testing::{StorageMode, SupplierOptions};

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Workload configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend to run against (default: inmemory)
    pub storage_mode: StorageMode,
    /// Number of trials to run (default: 20)
    pub n_trials: u64,
    /// Heartbeat interval in seconds, sqlite family only
    pub heartbeat_interval: Option<u64>,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Storage mode
        let mode_str = get("STORAGE_MODE").unwrap_or_else(|| "inmemory".into());
        let storage_mode = mode_str.parse::<StorageMode>().map_err(|e| ConfigError {
            field: "STORAGE_MODE",
            message: e.to_string(),
        })?;

        // Trial count
        let n_trials = match get("N_TRIALS") {
            Some(s) => s.parse::<u64>().ok().filter(|n| *n > 0).ok_or_else(|| ConfigError {
                field: "N_TRIALS",
                message: format!("Expected a positive integer, got '{}'", s),
            })?,
            None => 20,
        };

        // Heartbeat
        let heartbeat_interval = match get("HEARTBEAT_INTERVAL") {
            Some(s) => Some(s.parse::<u64>().ok().filter(|n| *n > 0).ok_or_else(|| {
                ConfigError {
                    field: "HEARTBEAT_INTERVAL",
                    message: format!("Expected a positive number of seconds, got '{}'", s),
                }
            })?),
            None => None,
        };
        validate_heartbeat(heartbeat_interval, None).map_err(|e| ConfigError {
            field: "HEARTBEAT_INTERVAL",
            message: e.to_string(),
        })?;
        if heartbeat_interval.is_some() && !storage_mode.supports_heartbeat() {
            return Err(ConfigError {
                field: "HEARTBEAT_INTERVAL",
                message: format!("Not supported by STORAGE_MODE={}", storage_mode),
            });
        }

        // Log format
        let log_format =
            LogFormat::from_str(&get("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            storage_mode,
            n_trials,
            heartbeat_interval,
            log_format,
        })
    }

    /// Supplier options matching this configuration.
    pub fn supplier_options(&self) -> SupplierOptions {
        let options = SupplierOptions::new();
        match self.heartbeat_interval {
            Some(seconds) => options.heartbeat_interval(seconds),
            None => options,
        }
    }
}
