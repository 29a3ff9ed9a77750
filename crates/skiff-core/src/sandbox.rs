//! Sandbox identity, pool records and the read-only snapshots handed outward.

use crate::error::Result;
use crate::lifecycle::{assert_transition, SandboxState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinHandle;

/// Runtime-assigned sandbox identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Wrap a runtime container id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw runtime id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, the way container ids are usually shown.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Immutable copy of a sandbox record.
///
/// This is the only view of pool state that leaves the pool; mutating a
/// snapshot has no effect on the sandbox it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSnapshot {
    /// Sandbox id.
    pub id: SandboxId,
    /// Lifecycle state when the snapshot was taken.
    pub state: SandboxState,
    /// Block bound to the sandbox, if any.
    pub block_id: Option<String>,
    /// Host port of the control plane.
    pub port: u16,
    /// Control-plane URL (`http://localhost:<port>`).
    pub address: String,
    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,
    /// When the sandbox was paused, if dormant.
    pub dormant_since: Option<DateTime<Utc>>,
    /// When the dormant sandbox will be terminated, if dormant.
    pub dormancy_deadline: Option<DateTime<Utc>>,
    /// Concurrent binders (single-sandbox mode).
    pub acquire_count: usize,
}

/// Scheduled auto-termination of a dormant sandbox.
///
/// Owned by the record it belongs to; must be cancelled on every transition
/// out of `dormant`.
#[derive(Debug)]
pub(crate) struct DormancyTimer {
    pub(crate) deadline: DateTime<Utc>,
    pub(crate) generation: u64,
    handle: JoinHandle<()>,
}

impl DormancyTimer {
    pub(crate) fn new(deadline: DateTime<Utc>, generation: u64, handle: JoinHandle<()>) -> Self {
        Self {
            deadline,
            generation,
            handle,
        }
    }

    /// Stop the scheduled termination.
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }

    /// Forget the handle without aborting; used by the timer task itself.
    pub(crate) fn disarm(self) {
        drop(self.handle);
    }
}

/// Pool-internal record of one sandbox.
#[derive(Debug)]
pub(crate) struct SandboxRecord {
    pub(crate) id: SandboxId,
    pub(crate) state: SandboxState,
    pub(crate) block_id: Option<String>,
    pub(crate) port: u16,
    pub(crate) address: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) dormant_since: Option<DateTime<Utc>>,
    pub(crate) dormancy: Option<DormancyTimer>,
    pub(crate) acquire_count: usize,
    /// A wake or terminate is in flight; never select this record.
    pub(crate) busy: bool,
}

impl SandboxRecord {
    /// A freshly created sandbox in `starting`.
    pub(crate) fn new(id: SandboxId, port: u16) -> Self {
        Self {
            id,
            state: SandboxState::Starting,
            block_id: None,
            port,
            address: skiff_runtime::address_for(port),
            created_at: Utc::now(),
            dormant_since: None,
            dormancy: None,
            acquire_count: 0,
            busy: false,
        }
    }

    /// Move to `to`, returning the previous state.
    pub(crate) fn transition(&mut self, to: SandboxState) -> Result<SandboxState> {
        assert_transition(self.state, to)?;
        let from = self.state;
        if !from.is_terminal() {
            self.state = to;
        }
        Ok(from)
    }

    /// Whether the record may be picked by an acquirer in `state`.
    pub(crate) fn selectable(&self, state: SandboxState) -> bool {
        self.state == state && !self.busy
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub(crate) fn cancel_dormancy(&mut self) {
        if let Some(timer) = self.dormancy.take() {
            timer.cancel();
        }
    }

    pub(crate) fn snapshot(&self) -> SandboxSnapshot {
        SandboxSnapshot {
            id: self.id.clone(),
            state: self.state,
            block_id: self.block_id.clone(),
            port: self.port,
            address: self.address.clone(),
            created_at: self.created_at,
            dormant_since: self.dormant_since,
            dormancy_deadline: self.dormancy.as_ref().map(|t| t.deadline),
            acquire_count: self.acquire_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_sandbox_id_display_and_short() {
        let id = SandboxId::new("0123456789abcdef0123");
        assert_eq!(id.to_string(), "0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(SandboxId::from("abc").short(), "abc");
    }

    #[test]
    fn test_record_starts_in_starting() {
        let record = SandboxRecord::new(SandboxId::from("c1"), 40001);
        assert_eq!(record.state, SandboxState::Starting);
        assert_eq!(record.address, "http://localhost:40001");
        assert!(record.is_live());
        assert!(record.selectable(SandboxState::Starting));
    }

    #[test]
    fn test_record_transition_checks_table() {
        let mut record = SandboxRecord::new(SandboxId::from("c1"), 40001);
        assert!(matches!(
            record.transition(SandboxState::Running),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert_eq!(record.transition(SandboxState::Idle).unwrap(), SandboxState::Starting);
        assert_eq!(record.transition(SandboxState::Terminated).unwrap(), SandboxState::Idle);
        // terminal self-loop is accepted and changes nothing
        assert_eq!(
            record.transition(SandboxState::Terminated).unwrap(),
            SandboxState::Terminated
        );
        assert!(!record.is_live());
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let mut record = SandboxRecord::new(SandboxId::from("c1"), 40001);
        let mut snapshot = record.snapshot();
        snapshot.block_id = Some("tampered".into());
        record.transition(SandboxState::Idle).unwrap();
        assert_eq!(record.block_id, None);
        assert_eq!(snapshot.state, SandboxState::Starting);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let record = SandboxRecord::new(SandboxId::from("c1"), 40001);
        let json = serde_json::to_value(record.snapshot()).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["state"], "starting");
        assert_eq!(json["blockId"], serde_json::Value::Null);
        assert_eq!(json["acquireCount"], 0);
    }
}
