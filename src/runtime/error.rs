//! Container runtime error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime client could not be created or the runtime is unreachable.
    #[error("Failed to connect to container runtime: {0}")]
    Connect(String),

    /// A runtime API request failed.
    #[error("Container runtime {operation} failed: {message}")]
    Request {
        /// The API operation (e.g. "list", "inspect").
        operation: &'static str,
        /// Error reported by the client.
        message: String,
    },

    /// A runtime API request did not complete in time.
    #[error("Container runtime {operation} timed out after {after:?}")]
    Timeout {
        /// The API operation.
        operation: &'static str,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The lifecycle event stream failed.
    #[error("Container event stream error: {0}")]
    Stream(String),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
