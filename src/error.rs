//! Error types shared by the membership, forwarding and supervisor layers.

use crate::supervisor::state::NodeState;
use thiserror::Error;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Errors raised by a membership provider.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The ring has no members, so no key can be resolved.
    #[error("Ring is empty, no owner for key {0}")]
    EmptyRing(String),

    /// None of the seed nodes could be contacted.
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// The provider has been shut down.
    #[error("Membership session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gossip codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Errors raised while delivering a forwarded call to another node.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The destination is not known to the local membership view.
    #[error("Destination {0} is not a reachable cluster member")]
    UnknownDestination(String),

    /// Every attempt of the retry schedule failed.
    #[error("Forward to {node} failed after {attempts} attempts: {reason}")]
    Exhausted {
        node: String,
        attempts: usize,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the supervisor at its programmatic boundary.
///
/// At the RPC boundary these are rendered into a FAILED `Response`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid entity id: {0}")]
    InvalidEntityId(String),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Delivery of a forwarded call failed.
    #[error("Forwarding {method} to {node} failed: {source}")]
    Forward {
        node: String,
        method: String,
        #[source]
        source: ForwardError,
    },

    /// The remote node received the call but reported a failure.
    #[error("Remote node {node} failed {method}: {message}")]
    Remote {
        node: String,
        method: String,
        message: String,
    },

    #[error("Store error: {0:#}")]
    Store(anyhow::Error),

    #[error("Failed to create entity {id}: {reason:#}")]
    Entity { id: String, reason: anyhow::Error },

    /// The node is draining or stopped and no longer takes ownership.
    #[error("Node {node} is {state}, refusing to start {id}")]
    NotAccepting {
        node: String,
        state: NodeState,
        id: String,
    },

    /// A membership event reported this node as removed from the ring.
    #[error("Node {0} was removed from the ring")]
    SelfRemoved(String),

    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),

    /// The payload kind does not match the method (ids vs. names).
    #[error("Unexpected payload for {0}")]
    UnexpectedPayload(String),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SupervisorError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        SupervisorError::Store(err)
    }
}
