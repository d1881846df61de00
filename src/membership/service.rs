use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::ring::{DEFAULT_REPLICAS, HashRing};
use super::types::{Envelope, GossipMessage, MemberState, MembershipEvent, Node, NodeId};
use crate::error::MembershipError;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    cluster: String,
    socket: Arc<UdpSocket>,
    incarnation: Arc<tokio::sync::RwLock<u64>>,
    ring: RwLock<HashRing>,
    events: broadcast::Sender<MembershipEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        cluster: &str,
    ) -> Result<Arc<Self>, MembershipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        // Port 0 binds resolve to the real port here.
        let gossip_addr = socket.local_addr()?;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr,
            http_addr,
            state: MemberState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        let ring = HashRing::with_members(DEFAULT_REPLICAS, [local_node.address()]);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new(Self {
            local_node,
            members,
            cluster: cluster.to_string(),
            socket: Arc::new(socket),
            incarnation: Arc::new(tokio::sync::RwLock::new(1)),
            ring: RwLock::new(ring),
            events,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Sends a join request to up to `join_size` seeds.
    ///
    /// Fails only when seeds were given and none of them could be addressed.
    pub async fn join(&self, seeds: &[SocketAddr], join_size: usize) -> Result<(), MembershipError> {
        if seeds.is_empty() {
            info!("Starting as seed node (founder) of cluster '{}'", self.cluster);
            return Ok(());
        }

        info!("Joining cluster '{}' via {} seed node(s)", self.cluster, seeds.len());

        let mut sent = 0;
        let mut last_error = None;
        for seed in seeds
            .iter()
            .filter(|seed| **seed != self.local_node.gossip_addr)
            .take(join_size.max(1))
        {
            let msg = GossipMessage::Join {
                node: self.local_node.clone(),
            };
            match self.send(&msg, *seed).await {
                Ok(()) => {
                    info!("Sent join request to {}", seed);
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to send join request to {}: {}", seed, e);
                    last_error = Some(e);
                }
            }
        }

        match (sent, last_error) {
            (0, Some(e)) => Err(MembershipError::Bootstrap(e.to_string())),
            _ => Ok(()),
        }
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([gossip_handle, receive_handle, failure_detection_handle]);
        }

        tracing::info!("All background tasks started");
    }

    /// Announces departure to the alive members and stops the background tasks.
    pub async fn leave(&self) {
        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        };
        self.broadcast_message(msg).await;

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        tracing::info!("Left cluster '{}'", self.cluster);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == MemberState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn find_by_address(&self, address: &str) -> Option<Node> {
        self.members
            .iter()
            .find(|entry| entry.value().address() == address)
            .map(|entry| entry.value().clone())
    }

    pub fn local_address(&self) -> String {
        self.local_node.address()
    }

    /// Owner of `key` on the current ring.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let ring = self.ring.read().unwrap_or_else(|e| e.into_inner());
        ring.lookup(key).map(str::to_string)
    }

    fn rebuild_ring(&self) {
        let addresses: Vec<String> = self
            .members
            .iter()
            .filter(|entry| entry.value().is_on_ring())
            .map(|entry| entry.value().address())
            .collect();

        let ring = HashRing::with_members(DEFAULT_REPLICAS, addresses);
        tracing::debug!("Ring rebuilt with {} members", ring.len());
        *self.ring.write().unwrap_or_else(|e| e.into_inner()) = ring;
    }

    fn notify(&self, event: MembershipEvent) {
        self.rebuild_ring();
        tracing::info!("Membership change: {:?}", event);
        // No subscribers is fine: nothing to tell.
        let _ = self.events.send(event);
    }

    async fn send(&self, msg: &GossipMessage, target: SocketAddr) -> Result<(), MembershipError> {
        let envelope = Envelope {
            cluster: self.cluster.clone(),
            message: msg.clone(),
        };
        let encoded = bincode::serialize(&envelope)?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == MemberState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                alive_members[idx].clone()
            };

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            if let Err(e) = self.send(&msg, target.gossip_addr).await {
                tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
            } else {
                tracing::trace!("Sent ping to {:?}", target.id);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<Envelope>(&buf[..len]) {
                    Ok(envelope) if envelope.cluster == self.cluster => {
                        if let Err(e) = self.handle_message(envelope.message, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Ok(envelope) => {
                        tracing::debug!(
                            "Ignoring message from {} for foreign cluster '{}'",
                            src,
                            envelope.cluster
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<(), MembershipError> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Leave { node_id } => {
                self.handle_leave(node_id);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> Result<(), MembershipError> {
        tracing::trace!("Received ping from {:?}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            // We only learn the gossip address from a ping; the full record
            // (with the RPC address) arrives with the next Ack or Join.
            tracing::debug!("Ping from unknown member {:?} at {}", from, src);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        self.send(&reply, src).await?;

        tracing::trace!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member).await;
        }
    }

    async fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            let my_incarnation = *self.incarnation.read().await;
            if new_member.state == MemberState::Dead && new_member.incarnation >= my_incarnation {
                tracing::error!("Cluster declared this node dead");
                self.notify(MembershipEvent::NodeRemoved(self.local_address()));
            }
            return;
        }

        let mut event = None;

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let was_on_ring = existing.is_on_ring();
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());

                    event = match (was_on_ring, existing.is_on_ring()) {
                        (false, true) => Some(MembershipEvent::NodeAdded(existing.address())),
                        (true, false) => Some(MembershipEvent::NodeRemoved(existing.address())),
                        _ => None,
                    };
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == MemberState::Alive
                    && existing.state == MemberState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = MemberState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None if new_member.state != MemberState::Dead => {
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());
                event = Some(MembershipEvent::NodeAdded(member_with_timestamp.address()));

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
            None => {}
        }

        if let Some(event) = event {
            self.notify(event);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return;
                }
                *inc = incarnation + 1;
                *inc
            };

            tracing::info!("Refuting suspicion with incarnation {}", my_incarnation);
            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = my_incarnation;
                me.state = MemberState::Alive;
                me.last_seen = Some(Instant::now());
            }

            let msg = GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            };
            self.broadcast_message(msg).await;
            return;
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == MemberState::Alive {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.gossip_addr);
                    existing.state = MemberState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let mut event = None;

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == MemberState::Suspect)
                {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    if existing.state == MemberState::Dead {
                        event = Some(MembershipEvent::NodeAdded(existing.address()));
                    }
                    existing.state = MemberState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }

        if let Some(event) = event {
            self.notify(event);
        }
    }

    async fn handle_join(&self, mut node: Node) -> Result<(), MembershipError> {
        tracing::info!("Node {:?} joining cluster at {}", node.id, node.gossip_addr);

        node.last_seen = Some(Instant::now());
        node.state = MemberState::Alive;
        let address = node.address();
        let gossip_addr = node.gossip_addr;
        let previous = self.members.insert(node.id.clone(), node);

        tracing::info!("Cluster size now: {}", self.members.len());

        if previous.map(|p| !p.is_on_ring()).unwrap_or(true) {
            self.notify(MembershipEvent::NodeAdded(address));
        }

        // Answer with the full member list so the joiner learns the cluster
        // without waiting for a gossip round.
        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: self
                .members
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };
        self.send(&reply, gossip_addr).await
    }

    fn handle_leave(&self, node_id: NodeId) {
        let removed = match self.members.get_mut(&node_id) {
            Some(mut existing) if existing.is_on_ring() => {
                tracing::info!("Node {:?} at {} left", existing.id, existing.gossip_addr);
                existing.state = MemberState::Dead;
                existing.incarnation += 1;
                Some(existing.address())
            }
            _ => None,
        };

        if let Some(address) = removed {
            self.notify(MembershipEvent::NodeRemoved(address));
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut removed = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                if let Some(last_seen) = member.last_seen {
                    let elapsed = now.duration_since(last_seen);

                    match member.state {
                        MemberState::Alive => {
                            if elapsed > SUSPECT_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} suspected (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = MemberState::Suspect;

                                messages_to_broadcast.push(GossipMessage::Suspect {
                                    node_id: member.id.clone(),
                                    incarnation: member.incarnation,
                                });
                            }
                        }

                        MemberState::Suspect => {
                            if elapsed > DEAD_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} declared DEAD (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = MemberState::Dead;
                                removed.push(member.address());
                            }
                        }

                        MemberState::Dead => {}
                    }
                } else {
                    member.last_seen = Some(now);
                }
            }

            for address in removed {
                self.notify(MembershipEvent::NodeRemoved(address));
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == MemberState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.send(&msg, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {:?}: {}", member.id, e);
            }
        }
    }
}

#[cfg(test)]
impl MembershipService {
    pub(crate) async fn inject(&self, msg: GossipMessage, src: SocketAddr) {
        if let Err(e) = self.handle_message(msg, src).await {
            tracing::warn!("Injected message failed: {}", e);
        }
    }
}
