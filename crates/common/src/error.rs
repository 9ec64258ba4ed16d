//! Common error types for router agent components.

use std::fmt;

/// A specialized Result type for router agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for router agent operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration apply failed: {0}")]
    Apply(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Keepalived error: {0}")]
    Keepalived(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new not-found error.
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    /// Create a new apply error.
    pub fn apply(msg: impl fmt::Display) -> Self {
        Error::Apply(msg.to_string())
    }

    /// Create a new command execution error.
    pub fn command(msg: impl fmt::Display) -> Self {
        Error::Command(msg.to_string())
    }

    /// Create a new keepalived error.
    pub fn keepalived(msg: impl fmt::Display) -> Self {
        Error::Keepalived(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Whether this error means the looked-up object does not exist (yet).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
