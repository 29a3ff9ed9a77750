//! Execution and lifecycle events.
//!
//! Events are for monitoring only; nothing in the pool or executor depends on
//! a sink observing them.

use crate::lifecycle::SandboxState;
use crate::plan::ExecutionStatus;
use crate::sandbox::SandboxId;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Something observable happened in the pool or executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// `execute` began.
    ExecutionStarted {
        /// Id shared by every event of this execution
        execution_id: Uuid,
        /// Number of lanes in the plan
        lanes: usize,
    },
    /// A lane was scheduled.
    LaneStarted {
        /// Index of the lane in the plan
        lane: usize,
        /// Blocks the lane runs
        block_ids: Vec<String>,
        /// Whether the lane is a parallel group
        parallel: bool,
        /// Merge hint of a parallel group
        #[serde(skip_serializing_if = "Option::is_none")]
        merge_strategy: Option<serde_json::Value>,
    },
    /// Every block of a lane settled.
    LaneCompleted {
        /// Index of the lane in the plan
        lane: usize,
        /// Blocks that succeeded
        succeeded: usize,
        /// Blocks that failed
        failed: usize,
    },
    /// A block failed.
    BlockError {
        /// Lane the block ran in
        lane: usize,
        /// Failed block
        block_id: String,
        /// Error reported by the runner or the pool
        error: String,
    },
    /// Execution stopped because `abort` was called.
    Aborted {
        /// First lane that did not run to completion
        lane: usize,
        /// Results collected before stopping
        results: usize,
    },
    /// `execute` returned.
    ExecutionCompleted {
        /// Id shared by every event of this execution
        execution_id: Uuid,
        /// How the execution ended
        status: ExecutionStatus,
        /// Number of block results in the report
        results: usize,
    },
    /// A sandbox changed lifecycle state.
    SandboxTransition {
        /// Sandbox that moved
        id: SandboxId,
        /// State before the transition
        from: SandboxState,
        /// State after the transition
        to: SandboxState,
        /// Block bound after the transition, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        block_id: Option<String>,
    },
}

impl Event {
    /// Channel name the event is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution:start",
            Self::LaneStarted { .. } => "lane:start",
            Self::LaneCompleted { .. } => "lane:complete",
            Self::BlockError { .. } => "block:error",
            Self::Aborted { .. } => "execution:aborted",
            Self::ExecutionCompleted { .. } => "execution:complete",
            Self::SandboxTransition { .. } => "sandbox:transition",
        }
    }

    /// JSON payload of the event.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Receives events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Publish one event.
    fn emit(&self, event: &Event);
}

impl<F> EventSink for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn emit(&self, event: &Event) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &Event) {}
}

/// Logs every event through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        tracing::debug!(channel = event.channel(), payload = %event.payload(), "event");
    }
}

/// Fans events out to any number of tokio broadcast subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &Event) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}
