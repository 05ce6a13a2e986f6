//! Error types for Phoenix
//!
//! One crate-wide error enum built on `thiserror`. The variants follow the
//! lifecycle of an upgrade: configuration is validated once at startup, then
//! every poll can fail while probing or retrieving, and a retrieved artifact
//! can fail while being staged, checked or installed.

use thiserror::Error;

/// The primary error type for Phoenix operations.
#[derive(Error, Debug)]
pub enum PhoenixError {
    /// Missing or invalid configuration. Fatal at startup, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure or non-success status on the lightweight metadata check.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// Transport failure or non-success status on the full retrieval.
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// The retrieval delivered fewer bytes than the metadata check reported.
    #[error("Size mismatch: stat reported {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    /// Staging or replacing the executable on disk failed.
    #[error("Install error: {0}")]
    Install(String),

    /// The staged executable did not answer the startup handshake.
    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    /// The parent watchdog could not be set up. Parent loss itself never
    /// surfaces as an error: it terminates the process.
    #[error("Watchdog error: {0}")]
    Watchdog(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PhoenixError {
    /// Returns `true` if the next scheduled poll may succeed where this one failed.
    ///
    /// Adapters never retry on their own; the fetch loop decides based on this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PhoenixError::Probe(_)
                | PhoenixError::Retrieval(_)
                | PhoenixError::SizeMismatch { .. }
                | PhoenixError::SanityCheck(_)
        )
    }

    pub(crate) fn probe(err: impl std::fmt::Display) -> Self {
        PhoenixError::Probe(err.to_string())
    }

    pub(crate) fn retrieval(err: impl std::fmt::Display) -> Self {
        PhoenixError::Retrieval(err.to_string())
    }
}

/// A specialized `Result` type for Phoenix operations.
pub type Result<T> = std::result::Result<T, PhoenixError>;
