use super::provider::MembershipProvider;
use super::service::MembershipService;
use super::types::{MemberState, MembershipEvent};
use crate::error::{ForwardError, MembershipError};
use crate::forwarding::client::HttpForwarder;
use crate::forwarding::protocol::ForwardOptions;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Production provider: UDP gossip for liveness, a consistent-hash ring over
/// the live members' RPC addresses, and HTTP for forwarded calls.
pub struct GossipMembership {
    service: Arc<MembershipService>,
    forwarder: HttpForwarder,
}

impl GossipMembership {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        cluster: &str,
    ) -> Result<Self, MembershipError> {
        let service = MembershipService::new(bind_addr, http_addr, cluster).await?;
        Ok(Self {
            service,
            forwarder: HttpForwarder::new(),
        })
    }

    pub fn service(&self) -> &Arc<MembershipService> {
        &self.service
    }
}

#[async_trait]
impl MembershipProvider for GossipMembership {
    fn who_am_i(&self) -> String {
        self.service.local_address()
    }

    fn lookup(&self, key: &str) -> Result<String, MembershipError> {
        self.service
            .lookup(key)
            .ok_or_else(|| MembershipError::EmptyRing(key.to_string()))
    }

    fn reachable_members(&self) -> Result<Vec<String>, MembershipError> {
        let mut members: Vec<String> = self
            .service
            .get_alive_members()
            .into_iter()
            .map(|node| node.address())
            .collect();
        members.sort();
        Ok(members)
    }

    async fn bootstrap(&self, seeds: &[String], join_size: usize) -> Result<(), MembershipError> {
        let seeds = seeds
            .iter()
            .map(|seed| {
                seed.parse::<SocketAddr>()
                    .map_err(|e| MembershipError::Bootstrap(format!("bad seed {}: {}", seed, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.service.join(&seeds, join_size).await?;
        self.service.clone().start().await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.service.subscribe()
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
        match self.service.find_by_address(destination) {
            Some(node) if node.state != MemberState::Dead => {}
            _ => return Err(ForwardError::UnknownDestination(destination.to_string())),
        }

        tracing::debug!(
            "Forwarding {}.{} for {:?} to {}",
            service,
            method,
            routing_keys,
            destination
        );

        self.forwarder
            .forward(destination, method, payload, options)
            .await
    }

    async fn shutdown(&self) {
        self.service.leave().await;
    }
}
