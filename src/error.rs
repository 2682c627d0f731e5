//! Error types for the fetch-and-deliver system.
//!
//! Batch-level precondition failures live in [`PeerfetchError`]. Per-artifact
//! failures never surface here: they are folded into the batch result as a
//! [`FetchOutcome`](crate::batch::FetchOutcome).

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the peerfetch error type.
pub type Result<T> = std::result::Result<T, PeerfetchError>;

/// Main error type for the fetch system.
#[derive(Error, Debug)]
pub enum PeerfetchError {
    /// Malformed or empty artifact identifier
    #[error("Invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// No requests were supplied for a batch
    #[error("Batch contains no requests")]
    EmptyBatch,

    /// The destination root is missing, relative, or not a directory
    #[error("Destination root is missing or not a directory: {}", .0.display())]
    MissingDestinationRoot(PathBuf),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The orchestrator is shutting down
    #[error("Orchestrator is shutting down")]
    Shutdown,

    /// Filesystem error outside of a delivery
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PeerfetchError {
    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        PeerfetchError::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
