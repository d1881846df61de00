use super::types::MembershipEvent;
use crate::error::{ForwardError, MembershipError};
use crate::forwarding::protocol::ForwardOptions;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// The capabilities the supervisor needs from a membership layer.
///
/// Addresses returned here are the identities used for ownership and as
/// forwarding destinations.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Address of the local node.
    fn who_am_i(&self) -> String;

    /// Owner of `key` according to the current local view of the ring.
    /// Read-only; may lag the global truth during a partition.
    fn lookup(&self, key: &str) -> Result<String, MembershipError>;

    /// Members currently considered alive, including the local node.
    fn reachable_members(&self) -> Result<Vec<String>, MembershipError>;

    /// Joins the cluster through up to `join_size` of the given seeds.
    async fn bootstrap(&self, seeds: &[String], join_size: usize) -> Result<(), MembershipError>;

    /// Registers a listener for topology changes.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    /// Delivers an already-encoded call to `destination` and returns the
    /// encoded reply, honoring the retry schedule in `options`.
    async fn forward(
        &self,
        destination: &str,
        routing_keys: &[String],
        service: &str,
        method: &str,
        payload: Vec<u8>,
        options: &ForwardOptions,
    ) -> Result<Vec<u8>, ForwardError>;

    /// Leaves the cluster and stops background work.
    async fn shutdown(&self);
}
