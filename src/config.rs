//! Configuration module for the rbox tunneling core
//!
//! This module provides TOML-based configuration parsing and validation
//! for the engine adapter, the subscription fetcher and logging.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Tunneling engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine executable
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,
    /// Arguments placed before the generated config path
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    /// Log line fragment that signals readiness (None = ready once spawned)
    #[serde(default)]
    pub ready_marker: Option<String>,
    /// Directory the engine runs in and where its config file is written
    pub working_dir: Option<PathBuf>,
    /// Startup timeout in milliseconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    /// Teardown timeout in milliseconds
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_ms: u64,
    /// Status probe budget in milliseconds
    #[serde(default = "default_status_probe")]
    pub status_probe_ms: u64,
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn status_probe(&self) -> Duration {
        Duration::from_millis(self.status_probe_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            args: default_engine_args(),
            ready_marker: None,
            working_dir: None,
            startup_timeout_ms: default_startup_timeout(),
            teardown_timeout_ms: default_teardown_timeout(),
            status_probe_ms: default_status_probe(),
        }
    }
}

/// Subscription fetching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Request timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// User agent sent with subscription requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Largest accepted document size in bytes
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            user_agent: default_user_agent(),
            max_body_bytes: default_max_body(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Subscription configuration
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.binary.as_os_str().is_empty() {
            return Err(VpnError::Config(
                "Engine binary path cannot be empty".to_string(),
            ));
        }

        if self.engine.startup_timeout_ms == 0 || self.engine.teardown_timeout_ms == 0 {
            return Err(VpnError::Config(
                "Engine startup and teardown timeouts must be non-zero".to_string(),
            ));
        }

        if self.engine.status_probe_ms == 0
            || self.engine.status_probe_ms >= self.engine.startup_timeout_ms
        {
            return Err(VpnError::Config(
                "Status probe must be non-zero and shorter than the startup timeout".to_string(),
            ));
        }

        if self.subscription.timeout_secs == 0 {
            return Err(VpnError::Config(
                "Subscription timeout cannot be zero".to_string(),
            ));
        }

        if self.subscription.max_body_bytes == 0 {
            return Err(VpnError::Config(
                "Subscription body limit cannot be zero".to_string(),
            ));
        }

        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(VpnError::Config(format!(
                "Unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

// Default value functions for serde
fn default_engine_binary() -> PathBuf {
    PathBuf::from("sing-box")
}

fn default_engine_args() -> Vec<String> {
    vec!["run".to_string(), "-c".to_string()]
}

fn default_startup_timeout() -> u64 {
    15_000
}

fn default_teardown_timeout() -> u64 {
    5_000
}

fn default_status_probe() -> u64 {
    50
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("rbox/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_body() -> usize {
    4 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}
