use super::entity::RecoverableEntity;
use super::reconcile;
use super::registry::LocalRegistry;
use super::state::{NodeState, StateCell};
use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::forwarding::RpcHandler;
use crate::forwarding::protocol::{
    HEADER_ORIGIN_NODE, HEADER_REQUEST_ID, METHOD_APP_DETAILS_UPDATE, METHOD_START_ENTITIES,
    METHOD_STOP_ENTITIES, Payload, Request, Response, SERVICE_NAME,
};
use crate::membership::provider::MembershipProvider;
use crate::membership::types::MembershipEvent;
use crate::store::types::{App, EntityId, EntityInfo, EntityStatus};
use crate::store::{ClusterStore, EntityFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Point-in-time view of the local registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorStats {
    pub node: String,
    pub state: NodeState,
    /// Entities in the local registry.
    pub registered: usize,
    /// Entities whose run is currently in progress.
    pub running: usize,
    /// Restarts across all registered entities.
    pub recovered: u64,
    /// Entities that exhausted their restart budget.
    pub failed: usize,
}

/// Outcome of a best-effort fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub succeeded: Vec<String>,
    /// `(node, error)` per member the call could not be delivered to.
    pub failed: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Coordination core of a node.
///
/// Decides where each entity runs, keeps the local registry in line with
/// that decision, persists every transition and reacts to topology changes.
pub struct Supervisor {
    node: String,
    membership: Arc<dyn MembershipProvider>,
    store: Arc<dyn ClusterStore>,
    factory: Arc<dyn EntityFactory>,
    registry: LocalRegistry,
    state: StateCell,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        membership: Arc<dyn MembershipProvider>,
        store: Arc<dyn ClusterStore>,
        factory: Arc<dyn EntityFactory>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let node = membership.who_am_i();
        tracing::info!("Supervisor created for node {}", node);

        Arc::new(Self {
            node,
            membership,
            store,
            factory,
            registry: LocalRegistry::new(),
            state: StateCell::new(NodeState::Booting),
            config,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // --- Local lifecycle ---

    /// Runs `id` on this node and persists it as running here.
    ///
    /// The wrapper is created on first use and reused afterwards. Starting an
    /// entity whose run is still in progress does not launch a second run.
    pub async fn start_entity(&self, id: &EntityId) -> SupervisorResult<bool> {
        let state = self.state.get();
        if !state.accepts_work() {
            return Err(SupervisorError::NotAccepting {
                node: self.node.clone(),
                state,
                id: id.to_string(),
            });
        }

        let entity = self.registry.get_or_try_insert(id, || {
            let obj = self
                .factory
                .create_entity(id)
                .and_then(|obj| obj.init().map(|()| obj))
                .map_err(|reason| SupervisorError::Entity {
                    id: id.to_string(),
                    reason,
                })?;
            Ok::<_, SupervisorError>(RecoverableEntity::new(
                id.clone(),
                obj,
                self.config.restart.clone(),
            ))
        })?;

        if entity.start() {
            tracing::info!("Started entity {} on {}", id, self.node);
        } else {
            tracing::debug!("Entity {} already running on {}", id, self.node);
        }

        self.store
            .update_entity_status(id, &self.node, EntityStatus::Running)
            .await
            .map_err(SupervisorError::store)?;

        // stop_node may have drained the registry before our insert landed.
        let state = self.state.get();
        if !state.accepts_work() {
            self.registry.remove(id);
            entity.stop();
            tracing::info!("Node {} went {} while starting {}, stopped it", self.node, state, id);
            self.store
                .update_entity_status(id, &self.node, EntityStatus::Stopped)
                .await
                .map_err(SupervisorError::store)?;
            return Err(SupervisorError::NotAccepting {
                node: self.node.clone(),
                state,
                id: id.to_string(),
            });
        }

        Ok(true)
    }

    /// Stops `id` if it runs here. Returns `false` when it was not registered.
    pub async fn stop_entity(&self, id: &EntityId) -> SupervisorResult<bool> {
        let Some(entity) = self.registry.remove(id) else {
            tracing::debug!("Entity {} not registered on {}, nothing to stop", id, self.node);
            return Ok(false);
        };

        entity.stop();
        tracing::info!("Stopped entity {} on {}", id, self.node);

        self.store
            .update_entity_status(id, &self.node, EntityStatus::Stopped)
            .await
            .map_err(SupervisorError::store)?;

        Ok(true)
    }

    /// Starts every id on its owner. The first failure aborts the batch.
    pub async fn start_entities(&self, ids: &[EntityId]) -> SupervisorResult<()> {
        self.start_routed(ids, None).await
    }

    /// Stops every id on its owner. The first failure aborts the batch.
    pub async fn stop_entities(&self, ids: &[EntityId]) -> SupervisorResult<()> {
        for id in ids {
            let owner = self.membership.lookup(id.as_str())?;
            if owner == self.node {
                self.stop_entity(id).await?;
            } else {
                self.forward(&owner, METHOD_STOP_ENTITIES, Payload::Ids { ids: vec![id.clone()] })
                    .await?;
            }
        }
        Ok(())
    }

    /// Ids owned elsewhere are forwarded, except back to `origin`: a call that
    /// came from a node which thinks we own the id is run here.
    async fn start_routed(&self, ids: &[EntityId], origin: Option<&str>) -> SupervisorResult<()> {
        for id in ids {
            let owner = self.membership.lookup(id.as_str())?;
            if owner == self.node || Some(owner.as_str()) == origin {
                self.start_entity(id).await?;
            } else {
                self.forward(&owner, METHOD_START_ENTITIES, Payload::Ids { ids: vec![id.clone()] })
                    .await?;
            }
        }
        Ok(())
    }

    // --- Boot & offload ---

    /// Starts every persisted entity this node owns, then turns the node
    /// active. Any failure aborts the boot.
    pub async fn boot(&self) -> SupervisorResult<()> {
        let infos = self
            .store
            .get_all_entities_info()
            .await
            .map_err(SupervisorError::store)?;

        tracing::info!("Booting {} with {} persisted entities", self.node, infos.len());

        for info in &infos {
            self.boot_entity(info, false).await?;
        }

        self.state.set(NodeState::Active);
        tracing::info!(
            "Boot complete: {} entities running on {}",
            self.registry.len(),
            self.node
        );
        Ok(())
    }

    /// Places one persisted entity on its current owner.
    ///
    /// When this node owns it but the record says it is running on another
    /// reachable node, that copy is stopped first. With `forward` unset,
    /// entities owned elsewhere are left to their owner.
    pub async fn boot_entity(&self, info: &EntityInfo, forward: bool) -> SupervisorResult<()> {
        let app = self
            .store
            .get_app(info.id.app_id())
            .await
            .map_err(SupervisorError::store)?;

        if !app.active {
            tracing::debug!("Skipping {}: app {} is inactive", info.id, app.app_id);
            return Ok(());
        }

        let owner = self.membership.lookup(info.id.as_str())?;

        if owner == self.node {
            if info.status == EntityStatus::Running && info.node != self.node {
                let reachable = self.membership.reachable_members()?;
                if reachable.contains(&info.node) {
                    tracing::info!(
                        "Entity {} still running on {}, stopping it there before taking over",
                        info.id,
                        info.node
                    );
                    self.forward(
                        &info.node,
                        METHOD_STOP_ENTITIES,
                        Payload::Ids { ids: vec![info.id.clone()] },
                    )
                    .await?;
                }
            }
            self.start_entity(&info.id).await?;
        } else if forward {
            self.forward(
                &owner,
                METHOD_START_ENTITIES,
                Payload::Ids { ids: vec![info.id.clone()] },
            )
            .await?;
        }

        Ok(())
    }

    /// Takes over the entities of a departed node that now belong here.
    ///
    /// Only entities of active apps are moved. With reconciliation enabled,
    /// every entity taken over gets its missed buckets replayed.
    pub async fn offload(&self, departed: &str) -> SupervisorResult<()> {
        let infos = self
            .store
            .get_all_entities_info_of_node(departed)
            .await
            .map_err(SupervisorError::store)?;

        tracing::info!("Offloading {} entities of departed node {}", infos.len(), departed);

        let mut taken = 0;
        for info in infos {
            let app = self
                .store
                .get_app(info.id.app_id())
                .await
                .map_err(SupervisorError::store)?;
            if !app.active {
                continue;
            }

            let owner = self.membership.lookup(info.id.as_str())?;
            if owner != self.node {
                continue;
            }

            self.start_entity(&info.id).await?;
            taken += 1;

            if self.config.reconciliation_enabled {
                match info.id.partition() {
                    Some(partition) => {
                        self.reconcile(&app, partition).await;
                    }
                    None => tracing::warn!("Cannot reconcile {}: no partition index", info.id),
                }
            }
        }

        tracing::info!("Took over {} entities from {}", taken, departed);
        Ok(())
    }

    /// Replays the missed buckets of one partition. Returns the number of
    /// buckets attempted.
    pub async fn reconcile(&self, app: &App, partition: u32) -> usize {
        let retriever = self.factory.entity_retriever(&app.app_id);
        reconcile::reconcile_partition(
            retriever.as_ref(),
            app,
            partition,
            chrono::Utc::now(),
            self.config.reconciliation_offset_minutes,
        )
        .await
    }

    // --- Apps ---

    pub async fn activate_app(&self, app: &App) -> SupervisorResult<()> {
        tracing::info!("Activating app {} ({} partitions)", app.app_id, app.partitions);
        self.start_entities(&app.entity_ids()).await?;
        self.broadcast_app_details_update(std::slice::from_ref(&app.app_id))
            .await;
        Ok(())
    }

    pub async fn deactivate_app(&self, app: &App) -> SupervisorResult<()> {
        tracing::info!("Deactivating app {} ({} partitions)", app.app_id, app.partitions);
        self.stop_entities(&app.entity_ids()).await?;
        self.broadcast_app_details_update(std::slice::from_ref(&app.app_id))
            .await;
        Ok(())
    }

    /// Drops the cached details of the named apps on this node.
    pub async fn app_details_update(&self, names: &[String]) {
        for name in names {
            self.store.invalidate_single_app_cache(name).await;
        }
        tracing::debug!("Invalidated app cache for {:?} on {}", names, self.node);
    }

    /// Invalidates the named apps on every reachable member, this node
    /// included. A member that cannot be reached is logged and skipped.
    pub async fn broadcast_app_details_update(&self, names: &[String]) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        self.app_details_update(names).await;
        report.succeeded.push(self.node.clone());

        let members = match self.membership.reachable_members() {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!("Cannot list members for app update broadcast: {}", e);
                return report;
            }
        };

        for member in members.into_iter().filter(|m| *m != self.node) {
            let payload = Payload::Names {
                names: names.to_vec(),
            };
            match self.forward(&member, METHOD_APP_DETAILS_UPDATE, payload).await {
                Ok(()) => report.succeeded.push(member),
                Err(e) => {
                    tracing::warn!("App update broadcast to {} failed: {}", member, e);
                    report.failed.push((member, e.to_string()));
                }
            }
        }

        report
    }

    // --- Membership ---

    pub async fn handle_membership_event(&self, event: MembershipEvent) -> SupervisorResult<()> {
        match event {
            MembershipEvent::NodeAdded(address) => {
                tracing::info!("Node {} joined the ring", address);
                Ok(())
            }
            MembershipEvent::NodeRemoved(address) if address == self.node => {
                tracing::error!("This node ({}) was removed from the ring", address);
                Err(SupervisorError::SelfRemoved(address))
            }
            MembershipEvent::NodeRemoved(address) => {
                let state = self.state.get();
                if !state.accepts_work() {
                    tracing::info!("Node {} left, not taking over while {}", address, state);
                    return Ok(());
                }
                tracing::info!("Node {} left the ring", address);
                self.offload(&address).await
            }
        }
    }

    /// Receiver for membership events. Events sent before this call are lost,
    /// so take it before bootstrap or boot.
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership.subscribe()
    }

    /// Applies membership events from `events` one at a time until the
    /// channel closes.
    ///
    /// Returns `Err(SelfRemoved)` when this node is dropped from the ring.
    /// Any other failure is logged and the loop carries on.
    pub async fn watch_membership(
        self: Arc<Self>,
        mut events: broadcast::Receiver<MembershipEvent>,
    ) -> SupervisorResult<()> {

        loop {
            match events.recv().await {
                Ok(event) => match self.handle_membership_event(event.clone()).await {
                    Err(e @ SupervisorError::SelfRemoved(_)) => return Err(e),
                    Err(e) => tracing::error!("Handling {:?} failed: {}", event, e),
                    Ok(()) => {}
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} membership events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Membership event channel closed");
                    return Ok(());
                }
            }
        }
    }

    /// Stops every local entity. The registry is empty afterwards and the
    /// node refuses new work.
    pub async fn stop_node(&self) {
        self.state.set(NodeState::Draining);
        tracing::info!("Stopping {} local entities on {}", self.registry.len(), self.node);

        while !self.registry.is_empty() {
            for id in self.registry.keys() {
                if let Err(e) = self.stop_entity(&id).await {
                    tracing::warn!("Failed to persist stop of {}: {}", id, e);
                }
            }
        }

        self.state.set(NodeState::Stopped);
        tracing::info!("Node {} stopped", self.node);
    }

    // --- RPC ---

    /// Checks that `method` is served here and decodes its envelope.
    pub fn decode_request(&self, method: &str, payload: &[u8]) -> SupervisorResult<Request> {
        match method {
            METHOD_START_ENTITIES | METHOD_STOP_ENTITIES | METHOD_APP_DETAILS_UPDATE => {}
            other => return Err(SupervisorError::UnknownMethod(other.to_string())),
        }

        let mut request: Request = serde_json::from_slice(payload)?;
        request.method = method.to_string();
        Ok(request)
    }

    /// Executes a forwarded call and renders the outcome as a `Response`.
    ///
    /// A forwarded stop hits this node's registry first, so a copy left
    /// running here is stopped even when the ring points elsewhere.
    pub async fn serve_request(&self, request: Request) -> Response {
        let origin = request.headers.get(HEADER_ORIGIN_NODE).map(String::as_str);
        let request_id = request
            .headers
            .get(HEADER_REQUEST_ID)
            .map(String::as_str)
            .unwrap_or("-");

        tracing::info!(
            "{} from {} (request {}) for {:?}",
            request.method,
            origin.unwrap_or("unknown"),
            request_id,
            request.routing_keys()
        );

        if request.destination != self.node {
            tracing::warn!(
                "Request {} was meant for {}, handling it on {}",
                request_id,
                request.destination,
                self.node
            );
        }

        let result = match (request.method.as_str(), &request.payload) {
            (METHOD_START_ENTITIES, Payload::Ids { ids }) => self.start_routed(ids, origin).await,
            (METHOD_STOP_ENTITIES, Payload::Ids { ids }) => self.stop_routed(ids, origin).await,
            (METHOD_APP_DETAILS_UPDATE, Payload::Names { names }) => {
                self.app_details_update(names).await;
                Ok(())
            }
            (method, _) => Err(SupervisorError::UnexpectedPayload(method.to_string())),
        };

        match result {
            Ok(()) => Response::success(&self.node),
            Err(e) => {
                tracing::error!("{} (request {}) failed: {}", request.method, request_id, e);
                Response::failure(&self.node, e)
            }
        }
    }

    /// Decodes and serves one forwarded call.
    pub async fn serve_rpc(&self, method: &str, payload: &[u8]) -> Response {
        match self.decode_request(method, payload) {
            Ok(request) => self.serve_request(request).await,
            Err(e) => {
                tracing::warn!("Rejected {} call: {}", method, e);
                Response::failure(&self.node, e)
            }
        }
    }

    /// Stops ids registered here. Others go to their owner, unless the owner
    /// is `origin`, which already had its chance to stop them.
    async fn stop_routed(&self, ids: &[EntityId], origin: Option<&str>) -> SupervisorResult<()> {
        for id in ids {
            if self.registry.contains(id) {
                self.stop_entity(id).await?;
                continue;
            }

            let owner = self.membership.lookup(id.as_str())?;
            if owner == self.node || Some(owner.as_str()) == origin {
                self.stop_entity(id).await?;
            } else {
                self.forward(&owner, METHOD_STOP_ENTITIES, Payload::Ids { ids: vec![id.clone()] })
                    .await?;
            }
        }
        Ok(())
    }

    /// Sends `payload` to `destination` and fails unless it answers SUCCESS.
    async fn forward(&self, destination: &str, method: &str, payload: Payload) -> SupervisorResult<()> {
        let request = Request::new(method, destination, payload)
            .with_header(HEADER_REQUEST_ID, &uuid::Uuid::new_v4().to_string())
            .with_header(HEADER_ORIGIN_NODE, &self.node);
        let routing_keys = request.routing_keys();
        let body = serde_json::to_vec(&request)?;

        tracing::debug!("Forwarding {} for {:?} to {}", method, routing_keys, destination);

        let reply = self
            .membership
            .forward(
                destination,
                &routing_keys,
                SERVICE_NAME,
                method,
                body,
                &self.config.forward,
            )
            .await
            .map_err(|source| SupervisorError::Forward {
                node: destination.to_string(),
                method: method.to_string(),
                source,
            })?;

        let response: Response = serde_json::from_slice(&reply)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SupervisorError::Remote {
                node: response.server_address,
                method: method.to_string(),
                message: response.error,
            })
        }
    }

    // --- Introspection ---

    pub fn stats(&self) -> SupervisorStats {
        let entities = self.registry.entities();
        SupervisorStats {
            node: self.node.clone(),
            state: self.state.get(),
            registered: entities.len(),
            running: entities.iter().filter(|e| e.is_running()).count(),
            recovered: entities.iter().map(|e| u64::from(e.recovered())).sum(),
            failed: entities.iter().filter(|e| e.has_failed()).count(),
        }
    }

    /// Ids registered on this node, sorted.
    pub fn local_entity_ids(&self) -> Vec<EntityId> {
        self.registry.keys()
    }

    pub fn is_running_locally(&self, id: &EntityId) -> bool {
        self.registry.contains(id)
    }

    pub fn local_entity(&self, id: &EntityId) -> Option<Arc<RecoverableEntity>> {
        self.registry.get(id)
    }
}

#[async_trait]
impl RpcHandler for Supervisor {
    async fn handle_rpc(&self, method: &str, payload: &[u8]) -> Vec<u8> {
        let response = self.serve_rpc(method, payload).await;
        serde_json::to_vec(&response).unwrap_or_default()
    }
}
