//! Error handling for servectl
//!
//! Low-level execution failures travel as [`crate::ExecutionResult`] values;
//! this error type covers configuration mistakes, unknown identities,
//! connection establishment and dial timeouts.

use crate::classify::ErrorKind;

/// Result type alias for servectl core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for servectl
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// A required host identity or server entry is missing
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// Establishing a connection failed
    #[error("Connection error ({kind}): {message}")]
    Connection { kind: ErrorKind, message: String },

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an unknown host error
    pub fn unknown_host(msg: impl Into<String>) -> Self {
        Self::UnknownHost(msg.into())
    }

    /// Create a connection error, classifying the message
    pub fn connection(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = crate::ErrorClassifier::classify(&message);
        Self::Connection { kind, message }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { kind, .. } => *kind,
            Error::Timeout(_) => ErrorKind::Timeout,
            other => crate::ErrorClassifier::classify(&other.to_string()),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Check if this error is a programmer/configuration mistake
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_) | Error::UnknownHost(_) | Error::Config(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::UnknownHost(_) => "unknown_host",
            Error::Connection { .. } => "connection",
            Error::Timeout(_) => "timeout",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
        }
    }
}
