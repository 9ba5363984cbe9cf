//! Error types and handling for the rbox tunneling core

use std::time::Duration;
use thiserror::Error;

/// Main error type for tunneling core operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// A builder parameter was missing, out of range or badly encoded
    #[error("Invalid parameter '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },

    /// A built config violates a cross-field or session constraint
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// A tunnel session is already starting or running
    #[error("A tunnel session is already active")]
    AlreadyRunning,

    /// The requested transition lost against a concurrent one
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The engine never reported ready within the startup timeout
    #[error("Engine did not become ready within {0:?}")]
    StartTimeout(Duration),

    /// Network transport errors
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed documents or entries
    #[error("Parse error: {0}")]
    Parse(String),

    /// Subscription yielded no usable outbound
    #[error("Subscription {0} contains no usable outbound")]
    EmptySubscription(String),

    /// Errors reported by the tunneling engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    pub fn invalid_parameter(field: &str, reason: impl Into<String>) -> Self {
        VpnError::InvalidParameter {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        VpnError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind, exposed to the host
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            VpnError::InvalidParameter { .. } => "invalid_parameter",
            VpnError::Validation { .. } => "validation_error",
            VpnError::AlreadyRunning => "already_running",
            VpnError::InvalidTransition(_) => "invalid_transition",
            VpnError::StartTimeout(_) => "start_timeout",
            VpnError::Network(_) => "network_error",
            VpnError::Parse(_) => "parse_error",
            VpnError::EmptySubscription(_) => "empty_subscription",
            VpnError::Engine(_) => "engine_error",
            VpnError::Config(_) => "config_error",
            VpnError::Io(_) => "io_error",
        }
    }

    /// Field named by parameter and validation errors
    pub fn field(&self) -> Option<&str> {
        match self {
            VpnError::InvalidParameter { field, .. } | VpnError::Validation { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Helper trait for converting foreign errors into an engine error with context
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Engine(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(err: serde_json::Error) -> Self {
        VpnError::Parse(format!("JSON error: {err}"))
    }
}

impl From<reqwest::Error> for VpnError {
    fn from(err: reqwest::Error) -> Self {
        VpnError::Network(err.to_string())
    }
}
