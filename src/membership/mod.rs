//! Membership & Discovery Module
//!
//! Tells the supervisor who is in the cluster, who owns a given key and how to
//! reach another node.
//!
//! ## Core Concepts
//! - **Provider**: `MembershipProvider` is the only surface the supervisor sees. It covers
//!   identity, ring lookup, reachable members, topology events and forwarding.
//! - **Gossip Protocol**: Nodes periodically exchange status updates via UDP to maintain a consistent view of the cluster.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" transition model with timeouts to handle node crashes.
//! - **Incarnation Numbers**: Solves conflict resolution when node state (Alive/Suspect) is disputed.
//! - **Hash Ring**: Ownership of a key is decided by a consistent-hash ring built from the members
//!   that are not dead. Every change to that set rebuilds the ring and emits a `MembershipEvent`.
//! - **Cluster Isolation**: Gossip datagrams carry the cluster name; nodes ignore other clusters.
//! - **Local Cluster**: An in-process provider sharing one ring between several nodes.

pub mod gossip;
pub mod local;
pub mod provider;
pub mod ring;
pub mod service;
pub mod types;

pub use gossip::GossipMembership;
pub use local::{LocalCluster, LocalMembership};
pub use provider::MembershipProvider;
pub use types::MembershipEvent;

#[cfg(test)]
mod tests;
