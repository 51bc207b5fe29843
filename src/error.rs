//! Error types for Tempo.

use thiserror::Error;

/// Main error type for Tempo operations.
#[derive(Error, Debug)]
pub enum TempoError {
    /// Configuration-related errors, including invalid limiter settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TempoError {
    fn from(err: config::ConfigError) -> Self {
        TempoError::Config(err.to_string())
    }
}

/// Result type alias for Tempo operations.
pub type Result<T> = std::result::Result<T, TempoError>;
