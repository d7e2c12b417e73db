//! Error types shared across Docket crates

use thiserror::Error;

/// Result type alias for common Docket operations
pub type Result<T> = std::result::Result<T, DocketError>;

/// Main error type for the common crate
#[derive(Error, Debug)]
pub enum DocketError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
