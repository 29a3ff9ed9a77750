//! Error types for skiff-runtime.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for skiff-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon answered with a non-success status
    #[error("runtime API error ({status}): {message}")]
    Api {
        /// HTTP status returned by the daemon
        status: u16,
        /// Message extracted from the daemon's error body
        message: String,
    },

    /// Container does not exist (anymore)
    #[error("container not found: {0}")]
    NotFound(String),

    /// Could not reach the daemon socket
    #[error("connection failed: {0}")]
    Connection(String),

    /// Sandbox never answered its health endpoint in time
    #[error("health check on port {port} timed out after {timeout:?}")]
    HealthTimeout {
        /// Host port that was polled
        port: u16,
        /// Total time spent polling
        timeout: Duration,
    },

    /// Transport-level HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Request could not be built
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// True when the error means the container is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
