//! # Engine Configuration
//!
//! Typed configuration for the three engine components. Every section has
//! compiled defaults, so a missing file or key falls back to a working value;
//! [`ConfigManager`] layers TOML files and `STEPRUNNER__*` environment
//! variables on top and validates the result.
//!
//! ```rust,no_run
//! use steprunner_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let capacity = manager.config().restraint.capacity_for("repo-x");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod flags;
pub mod loader;

use crate::constants::system;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use flags::{FeatureFlags, StaticFeatureFlags};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub restraint: RestraintConfig,
    pub verification: VerificationConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Used when an executable returns no timeout of its own
    pub default_callback_timeout_ms: u64,
    /// Waiters without a timeout older than this are reported as stuck
    pub stuck_callback_threshold_secs: u64,
    pub event_channel_capacity: usize,
    /// Unclaimed responses and completed callback ids are forgotten after this
    pub response_retention_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_callback_timeout_ms: system::DEFAULT_CALLBACK_TIMEOUT_MS,
            stuck_callback_threshold_secs: 3600,
            event_channel_capacity: 1000,
            response_retention_secs: system::DEFAULT_RESPONSE_RETENTION_SECS,
        }
    }
}

impl ExecutionConfig {
    pub fn default_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.default_callback_timeout_ms)
    }

    pub fn stuck_callback_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_callback_threshold_secs)
    }

    pub fn response_retention(&self) -> Duration {
        Duration::from_secs(self.response_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestraintConfig {
    pub default_capacity: i32,
    /// Capacity overrides keyed by resource unit
    pub unit_capacities: HashMap<String, i32>,
    pub register_max_attempts: u32,
    pub lock_lease_ms: u64,
    pub lock_retry_backoff_ms: u64,
    pub lock_max_attempts: u32,
    pub cleanup_interval_secs: u64,
    /// Only enforced when the max-queue feature flag is on
    pub max_queue_length: usize,
}

impl Default for RestraintConfig {
    fn default() -> Self {
        Self {
            default_capacity: system::DEFAULT_RESOURCE_CAPACITY,
            unit_capacities: HashMap::new(),
            register_max_attempts: 5,
            lock_lease_ms: 5_000,
            lock_retry_backoff_ms: 20,
            lock_max_attempts: 50,
            cleanup_interval_secs: 60,
            max_queue_length: system::DEFAULT_MAX_QUEUE_LENGTH,
        }
    }
}

impl RestraintConfig {
    pub fn capacity_for(&self, resource_unit: &str) -> i32 {
        self.unit_capacities
            .get(resource_unit)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_retry: u32,
    /// Host sampling polls before insufficient data is reported as skipped
    pub max_sampling_polls: u32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_retry: system::DEFAULT_MAX_RETRY,
            max_sampling_polls: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    /// Configured URL, falling back to `DATABASE_URL`
    pub fn database_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.restraint.default_capacity <= 0 {
            return Err(ConfigurationError::invalid_value(
                "restraint.default_capacity",
                self.restraint.default_capacity.to_string(),
                "capacity must be greater than 0",
            ));
        }

        if let Some((unit, capacity)) = self
            .restraint
            .unit_capacities
            .iter()
            .find(|(_, capacity)| **capacity <= 0)
        {
            return Err(ConfigurationError::invalid_value(
                format!("restraint.unit_capacities.{unit}"),
                capacity.to_string(),
                "capacity must be greater than 0",
            ));
        }

        if self.restraint.register_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "restraint.register_max_attempts",
                "0",
                "at least one registration attempt is required",
            ));
        }

        if self.restraint.lock_lease_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "restraint.lock_lease_ms",
                "0",
                "a zero lease never excludes other holders",
            ));
        }

        if self.restraint.lock_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "restraint.lock_max_attempts",
                "0",
                "at least one lock attempt is required",
            ));
        }

        if self.verification.max_retry == 0 {
            return Err(ConfigurationError::invalid_value(
                "verification.max_retry",
                "0",
                "max_retry must be greater than 0",
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        Ok(())
    }
}
