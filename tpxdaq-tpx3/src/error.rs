//! Decoder error types.

use thiserror::Error;

/// Result type for decoder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Decoder error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid decoder configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Malformed configuration document.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
