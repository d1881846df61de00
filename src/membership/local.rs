//! In-process cluster.
//!
//! Several supervisors in one process share a `LocalCluster`: one ring, one
//! view of who is reachable, and direct calls instead of HTTP for forwarding.
//! Used to run multi-node scenarios without sockets.

use super::provider::MembershipProvider;
use super::ring::{DEFAULT_REPLICAS, HashRing};
use super::types::MembershipEvent;
use crate::error::{ForwardError, MembershipError};
use crate::forwarding::RpcHandler;
use crate::forwarding::protocol::ForwardOptions;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

struct LocalNode {
    events: broadcast::Sender<MembershipEvent>,
    handler: Option<Weak<dyn RpcHandler>>,
}

pub struct LocalCluster {
    ring: RwLock<HashRing>,
    nodes: DashMap<String, LocalNode>,
    unreachable: DashSet<String>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ring: RwLock::new(HashRing::new(DEFAULT_REPLICAS)),
            nodes: DashMap::new(),
            unreachable: DashSet::new(),
        })
    }

    /// Adds a node to the ring and tells the existing members about it.
    pub fn join(self: &Arc<Self>, address: &str) -> Arc<LocalMembership> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.nodes.insert(
            address.to_string(),
            LocalNode {
                events: events.clone(),
                handler: None,
            },
        );
        self.write_ring().add(address);
        tracing::info!("{} joined local cluster", address);
        self.publish(MembershipEvent::NodeAdded(address.to_string()), Some(address));

        Arc::new(LocalMembership {
            cluster: self.clone(),
            address: address.to_string(),
            events,
        })
    }

    /// Routes forwarded calls for `address` to `handler`.
    pub fn register_handler(&self, address: &str, handler: Weak<dyn RpcHandler>) {
        if let Some(mut node) = self.nodes.get_mut(address) {
            node.handler = Some(handler);
        }
    }

    /// Takes a node off the ring and announces the removal to every node,
    /// the removed one included.
    pub fn remove(&self, address: &str) {
        self.write_ring().remove(address);
        let event = MembershipEvent::NodeRemoved(address.to_string());
        self.publish(event.clone(), None);
        self.nodes.remove(address);
        tracing::info!("{} removed from local cluster", address);
    }

    /// A node marked unreachable stays on the ring but drops every call.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(address.to_string());
        } else {
            self.unreachable.remove(address);
        }
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.read_ring().lookup(key).map(str::to_string)
    }

    fn publish(&self, event: MembershipEvent, skip: Option<&str>) {
        for node in self.nodes.iter() {
            if Some(node.key().as_str()) == skip {
                continue;
            }
            let _ = node.value().events.send(event.clone());
        }
    }

    fn handler(&self, address: &str) -> Option<Arc<dyn RpcHandler>> {
        if self.unreachable.contains(address) {
            return None;
        }
        self.nodes
            .get(address)
            .and_then(|node| node.handler.as_ref().and_then(Weak::upgrade))
    }

    fn read_ring(&self) -> std::sync::RwLockReadGuard<'_, HashRing> {
        self.ring.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_ring(&self) -> std::sync::RwLockWriteGuard<'_, HashRing> {
        self.ring.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's handle onto a `LocalCluster`.
pub struct LocalMembership {
    cluster: Arc<LocalCluster>,
    address: String,
    events: broadcast::Sender<MembershipEvent>,
}

#[async_trait]
impl MembershipProvider for LocalMembership {
    fn who_am_i(&self) -> String {
        self.address.clone()
    }

    fn lookup(&self, key: &str) -> Result<String, MembershipError> {
        self.cluster
            .lookup(key)
            .ok_or_else(|| MembershipError::EmptyRing(key.to_string()))
    }

    fn reachable_members(&self) -> Result<Vec<String>, MembershipError> {
        Ok(self
            .cluster
            .read_ring()
            .members()
            .iter()
            .filter(|member| !self.cluster.unreachable.contains(member.as_str()))
            .cloned()
            .collect())
    }

    async fn bootstrap(&self, seeds: &[String], _join_size: usize) -> Result<(), MembershipError> {
        if !self.cluster.nodes.contains_key(&self.address) {
            return Err(MembershipError::Closed);
        }
        tracing::debug!("{} bootstrapped (seeds {:?})", self.address, seeds);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    async fn forward(
        &self,
        destination: &str,
        routing_keys: &[String],
        service: &str,
        method: &str,
        payload: Vec<u8>,
        options: &ForwardOptions,
    ) -> Result<Vec<u8>, ForwardError> {
        if !self.cluster.nodes.contains_key(destination) {
            return Err(ForwardError::UnknownDestination(destination.to_string()));
        }

        let attempts = options.attempts();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(options.backoff(attempt - 1)).await;
            }

            if let Some(handler) = self.cluster.handler(destination) {
                tracing::debug!(
                    "{} -> {}: {}.{} {:?}",
                    self.address,
                    destination,
                    service,
                    method,
                    routing_keys
                );
                return Ok(handler.handle_rpc(method, &payload).await);
            }
        }

        Err(ForwardError::Exhausted {
            node: destination.to_string(),
            attempts,
            reason: "destination unreachable".to_string(),
        })
    }

    async fn shutdown(&self) {
        self.cluster.remove(&self.address);
    }
}
