//! Sandbox lifecycle states and the fixed transition table.
//!
//! ```text
//! starting ──▶ idle ──▶ running ──▶ dormant
//!    │          │  ▲        │          │
//!    │          │  └────────┼──────────┘ (wake)
//!    ▼          ▼           ▼          ▼
//!  terminated ◀─────────────────────────  (terminated ─▶ terminated)
//! ```

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a pooled sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Container created, service not yet healthy.
    Starting,
    /// Healthy and unbound.
    Idle,
    /// Bound to a block.
    Running,
    /// Paused, waiting to be woken or to expire.
    Dormant,
    /// Stopped and removed. Terminal.
    Terminated,
}

impl SandboxState {
    /// Every state, in lifecycle order.
    pub const ALL: [SandboxState; 5] = [
        Self::Starting,
        Self::Idle,
        Self::Running,
        Self::Dormant,
        Self::Terminated,
    ];

    /// Legal destinations from this state.
    pub fn allowed_transitions(self) -> &'static [SandboxState] {
        use SandboxState::*;
        match self {
            Starting => &[Idle, Terminated],
            Idle => &[Running, Terminated],
            Running => &[Dormant, Terminated],
            Dormant => &[Idle, Terminated],
            Terminated => &[Terminated],
        }
    }

    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Dormant => "dormant",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sandbox state: {s}"))
    }
}

/// Whether `from -> to` is a legal lifecycle transition.
pub fn is_valid_transition(from: SandboxState, to: SandboxState) -> bool {
    from.allowed_transitions().contains(&to)
}

/// Fail with [`CoreError::InvalidTransition`] unless `from -> to` is legal.
pub fn assert_transition(from: SandboxState, to: SandboxState) -> Result<()> {
    if is_valid_transition(from, to) {
        return Ok(());
    }
    let allowed = from
        .allowed_transitions()
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    Err(CoreError::InvalidTransition { from, to, allowed })
}
