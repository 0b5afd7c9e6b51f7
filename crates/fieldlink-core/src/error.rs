//! Umbrella error type shared across the workspace.

use thiserror::Error;

/// Result type alias using the core error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced across crate boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// Broker connection or publish/subscribe failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistence collaborator failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input rejected before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}
