use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

/// Represents a single member in the cluster.
///
/// `http_addr` is the member's identity on the ring: it is what `lookup`
/// returns and where forwarded calls are POSTed. The `incarnation` field is a
/// logical clock used to order updates and resolve conflicts (e.g., refuting a
/// false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: MemberState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    /// Address used for ownership and forwarding.
    pub fn address(&self) -> String {
        self.http_addr.to_string()
    }

    /// Suspects stay on the ring until they are declared dead.
    pub fn is_on_ring(&self) -> bool {
        self.state != MemberState::Dead
    }
}

/// Every datagram is tagged with the cluster name; foreign ones are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cluster: String,
    pub message: GossipMessage,
}

/// The wire protocol for inter-node communication.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
/// - `Leave`: Sent on graceful shutdown so peers drop the node immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
    },
}

/// Topology change, keyed by member address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeAdded(String),
    NodeRemoved(String),
}
