//! Error types shared across Sluice crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}
