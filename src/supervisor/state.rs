use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a node with respect to the cluster.
///
/// `Booting -> Active -> Draining -> Stopped`. Only `Booting` and `Active`
/// nodes take ownership of entities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Active,
    Draining,
    Stopped,
}

impl NodeState {
    pub fn accepts_work(self) -> bool {
        matches!(self, NodeState::Booting | NodeState::Active)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Booting,
            1 => NodeState::Active,
            2 => NodeState::Draining,
            _ => NodeState::Stopped,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Booting => "booting",
            NodeState::Active => "active",
            NodeState::Draining => "draining",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding the current `NodeState`.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: NodeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `next` and returns the previous state.
    pub fn set(&self, next: NodeState) -> NodeState {
        NodeState::from_u8(self.0.swap(next as u8, Ordering::SeqCst))
    }
}
