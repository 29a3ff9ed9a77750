//! The block runner contract used by the lane executor.

use crate::sandbox::SandboxSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type runners may return; converted into a failed block result.
pub type RunnerError = Box<dyn std::error::Error + Send + Sync>;

/// What a runner reports for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOutcome {
    /// Whether the block succeeded.
    pub success: bool,
    /// Opaque output.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Wall time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl BlockOutcome {
    /// Successful outcome.
    pub fn ok(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms,
        }
    }

    /// Failed outcome.
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Executes one block inside an acquired sandbox.
///
/// Runners only ever see a snapshot; the sandbox's address and id are all
/// they should need.
#[async_trait]
pub trait BlockRunner: Send + Sync {
    /// Run `block_id` in `sandbox`.
    async fn run_block(
        &self,
        block_id: &str,
        sandbox: &SandboxSnapshot,
    ) -> Result<BlockOutcome, RunnerError>;
}
