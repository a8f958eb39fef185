//! Error types shared across Spinlog crates

use thiserror::Error;

/// Result type alias for Spinlog operations
pub type Result<T> = std::result::Result<T, SpinlogError>;

/// Main error type for Spinlog
#[derive(Error, Debug)]
pub enum SpinlogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid year-month: {0}")]
    InvalidYearMonth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
