//! Configuration for coalescing groups.
//!
//! Configuration is assembled from three sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults.
//!
//! # Example
//!
//! ```ignore
//! use rsflight_core::config::CoalesceConfig;
//! use rsflight_core::CallGroup;
//!
//! let config = CoalesceConfig::load("rsflight.yaml")?;
//! let group: CallGroup<String, Vec<u8>, String> = CallGroup::with_config(config.group);
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for overrides, e.g. `RSFLIGHT_GROUP__NAME`.
const ENV_PREFIX: &str = "RSFLIGHT";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CoalesceConfig {
    /// Settings shared by every group built from this configuration.
    #[serde(default)]
    pub group: GroupConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Per-group settings.
///
/// # Example YAML Configuration
///
/// ```yaml
/// group:
///   name: thumbnails
///   slow_call_threshold_ms: 500
///   initial_capacity: 64
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GroupConfig {
    /// Name attached to every log event emitted by the group.
    #[serde(default = "default_group_name")]
    pub name: String,

    /// Warn when a call runs longer than this many milliseconds.
    ///
    /// `0` disables the warning.
    /// Environment variable: `RSFLIGHT_GROUP__SLOW_CALL_THRESHOLD_MS`
    #[serde(default)]
    pub slow_call_threshold_ms: u64,

    /// Number of keys the in-flight table is sized for up front.
    #[serde(default)]
    pub initial_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            slow_call_threshold_ms: 0,
            initial_capacity: 0,
        }
    }
}

impl GroupConfig {
    /// Sets the group name used in log events.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the slow-call warning threshold.
    pub fn with_slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the initial capacity of the in-flight table.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// The slow-call threshold, or `None` when the warning is disabled.
    pub fn slow_call_threshold(&self) -> Option<Duration> {
        (self.slow_call_threshold_ms > 0).then(|| Duration::from_millis(self.slow_call_threshold_ms))
    }
}

fn default_group_name() -> String {
    "default".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl CoalesceConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `RSFLIGHT_` and use `__` as separator:
    /// - `RSFLIGHT_GROUP__NAME=thumbnails` overrides `group.name`
    /// - `RSFLIGHT_LOGGING__LEVEL=debug` overrides `logging.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&CoalesceConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(env_source())
            .build()?;

        let coalesce_config: CoalesceConfig = config.try_deserialize()?;
        coalesce_config.validate()?;

        Ok(coalesce_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&CoalesceConfig::default())?)
            .add_source(env_source())
            .build()?;

        let coalesce_config: CoalesceConfig = config.try_deserialize()?;
        coalesce_config.validate()?;

        Ok(coalesce_config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.group.name.trim().is_empty() {
            return Err(ConfigLoadError::Invalid {
                message: "group.name must not be empty".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        Ok(())
    }
}

// RSFLIGHT_GROUP__NAME -> group.name
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}
