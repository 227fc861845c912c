//! Transaction versions.
//!
//! A version is a coarse clock reading plus a per-node counter, tie-broken by
//! the issuing node. Versions are assigned once when a transaction begins and
//! are the comparison key for every conflict and ordering decision.

use crate::ids::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable, totally ordered transaction version.
///
/// The total ordering is: physical time, then logical counter, then node ID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TxVersion {
    /// Coarse physical time (milliseconds since Unix epoch)
    pub physical: u64,
    /// Counter for uniqueness within the same physical tick
    pub logical: u32,
    /// Node that issued this version
    pub node: NodeId,
}

impl TxVersion {
    pub const fn new(physical: u64, logical: u32, node: NodeId) -> Self {
        Self {
            physical,
            logical,
            node,
        }
    }

    /// Parse from string format: "physical_logical_node"
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(format!(
                "Invalid version format: {} (expected physical_logical_node)",
                s
            ));
        }

        let physical = parts[0]
            .parse()
            .map_err(|_| format!("Invalid physical component: {}", parts[0]))?;
        let logical = parts[1]
            .parse()
            .map_err(|_| format!("Invalid logical component: {}", parts[1]))?;
        let node = NodeId::parse(parts[2])?;

        Ok(Self::new(physical, logical, node))
    }
}

impl PartialOrd for TxVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical
            .cmp(&other.physical)
            .then(self.logical.cmp(&other.logical))
            .then(self.node.cmp(&other.node))
    }
}

impl fmt::Display for TxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.physical,
            self.logical,
            self.node.as_uuid().simple()
        )
    }
}

/// Issues strictly increasing versions for one node.
pub struct VersionClock {
    node: NodeId,
    /// (last physical tick, logical counter within that tick)
    state: Mutex<(u64, u32)>,
}

impl VersionClock {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: Mutex::new((0, 0)),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Issue the next version.
    pub fn next(&self) -> TxVersion {
        let physical = coarse_now();
        let mut state = self.state.lock();

        if physical > state.0 {
            *state = (physical, 0);
        } else {
            state.1 += 1;
        }

        TxVersion::new(state.0, state.1, self.node)
    }

    /// Advance the clock past a version received from another node, so that
    /// versions issued afterwards order after it.
    pub fn observe(&self, received: &TxVersion) {
        let mut state = self.state.lock();

        if received.physical > state.0 {
            *state = (received.physical, received.logical);
        } else if received.physical == state.0 && received.logical > state.1 {
            state.1 = received.logical;
        }
    }
}

fn coarse_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
