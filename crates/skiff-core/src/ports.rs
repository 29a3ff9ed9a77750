//! Host port allocation for sandbox control-plane addresses.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Closed range of host ports `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port (inclusive).
    pub end: u16,
}

impl PortRange {
    /// Create a range; `start` must not exceed `end`.
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start > end {
            return Err(CoreError::InvalidConfig(format!(
                "port range start {start} is above end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        usize::from(self.end) - usize::from(self.start) + 1
    }

    /// Never true for a validated range.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Whether `port` lies inside the range.
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 40000,
            end: 40099,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Hands out unique ports from a [`PortRange`] and takes them back.
///
/// Allocation scans forward from a cursor and wraps around, so a port released
/// anywhere in the range is found again without keeping a free list.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    cursor: u16,
    used: HashSet<u16>,
}

impl PortAllocator {
    /// Create an allocator over `range`.
    pub fn new(range: PortRange) -> Result<Self> {
        let range = PortRange::new(range.start, range.end)?;
        Ok(Self {
            range,
            cursor: range.start,
            used: HashSet::with_capacity(range.len().min(1024)),
        })
    }

    /// Reserve the next free port.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PortsExhausted`] when every port is in use.
    pub fn allocate(&mut self) -> Result<u16> {
        let size = self.range.len();
        let offset = usize::from(self.cursor - self.range.start);
        for i in 0..size {
            let candidate = self.range.start + ((offset + i) % size) as u16;
            if self.used.insert(candidate) {
                self.cursor = if candidate == self.range.end {
                    self.range.start
                } else {
                    candidate + 1
                };
                tracing::trace!(port = candidate, available = self.available(), "Port allocated");
                return Ok(candidate);
            }
        }
        Err(CoreError::PortsExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Return a port to the range. Unknown ports are ignored.
    pub fn release(&mut self, port: u16) {
        if self.used.remove(&port) {
            tracing::trace!(port, available = self.available(), "Port released");
        }
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.range.len() - self.used.len()
    }

    /// Whether `port` is currently allocated.
    pub fn in_use(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    /// The managed range.
    pub fn range(&self) -> PortRange {
        self.range
    }
}
