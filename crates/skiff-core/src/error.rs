//! Error types for skiff-core.

use crate::lifecycle::SandboxState;
use crate::SandboxId;
use thiserror::Error;

/// Result type alias for skiff-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during pool and executor operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Every port in the configured range is in use
    #[error("ports exhausted: no free port in range {start}-{end}")]
    PortsExhausted {
        /// First port of the range
        start: u16,
        /// Last port of the range (inclusive)
        end: u16,
    },

    /// A dormant sandbox could not be resumed
    #[error("failed to wake sandbox {id}: {reason}")]
    WakeFailed {
        /// Sandbox that failed to wake
        id: SandboxId,
        /// Underlying cause
        reason: String,
    },

    /// A container runtime call failed
    #[error("runtime operation '{operation}' failed: {source}")]
    Runtime {
        /// Which runtime call failed (create, start, pause, ...)
        operation: &'static str,
        /// Error returned by the runtime
        #[source]
        source: skiff_runtime::RuntimeError,
    },

    /// Acquire found no idle or wakeable sandbox and the pool is at capacity
    #[error("no sandbox available (max {max} sandboxes)")]
    NoSandboxAvailable {
        /// Configured cap
        max: usize,
    },

    /// Lifecycle invariant violated
    #[error("invalid transition {from} -> {to} (allowed from {from}: {allowed})")]
    InvalidTransition {
        /// Current state
        from: SandboxState,
        /// Requested state
        to: SandboxState,
        /// Legal destinations from `from`, comma separated
        allowed: String,
    },

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// Pool configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Execution plan rejected
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl CoreError {
    /// Wrap a runtime error with the name of the failing operation.
    pub fn runtime(operation: &'static str, source: skiff_runtime::RuntimeError) -> Self {
        Self::Runtime { operation, source }
    }
}
