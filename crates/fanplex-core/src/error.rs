//! Error types for `fanplex` core library.

use thiserror::Error;

/// Result type alias using `fanplex` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `fanplex` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tracing subscriber could not be installed
    #[error("Logging setup error: {0}")]
    Logging(String),

    /// A merge/split worker panicked or was aborted
    #[error("Session task failed: {0}")]
    TaskFailed(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
