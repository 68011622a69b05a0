//! Error types for sailkit.

use thiserror::Error;

/// A specialized Result type for sailkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the client registry.
///
/// Cloneable so one failed construction can be handed to every caller that
/// waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No configuration section exists for the requested name
    #[error("no configuration found for client '{name}': {reason}")]
    ConfigurationMissing { name: String, reason: String },

    /// The section declares a dialect tag the registry does not know
    #[error("client '{name}' declares unsupported dialect '{dialect}'")]
    UnsupportedDialect { name: String, dialect: String },

    /// The driver failed to open the backend
    #[error("failed to connect client '{name}': {message}")]
    ConnectionFailed { name: String, message: String },

    /// The driver failed to close the backend during drain
    #[error("failed to close client '{name}': {message}")]
    CloseFailed { name: String, message: String },
}

impl RegistryError {
    pub(crate) fn missing(name: &str, reason: impl Into<String>) -> Self {
        Self::ConfigurationMissing {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn connection(name: &str, err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn close(name: &str, err: impl std::fmt::Display) -> Self {
        Self::CloseFailed {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    /// Name of the client the error refers to
    pub fn name(&self) -> &str {
        match self {
            Self::ConfigurationMissing { name, .. }
            | Self::UnsupportedDialect { name, .. }
            | Self::ConnectionFailed { name, .. }
            | Self::CloseFailed { name, .. } => name,
        }
    }
}

/// The error type for sailkit operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Settings loaded but failed validation
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Client registry errors
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),

    /// The configuration file watcher could not be started
    #[error("Config watch error: {0}")]
    Watch(#[from] notify::Error),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
