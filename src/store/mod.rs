//! Cluster Store & Entity Collaborators
//!
//! The supervisor does not own persistence or the work an entity performs. This module
//! defines the seams it consumes and an in-memory store used by the binary and tests.
//!
//! ## Core Concepts
//! - **ClusterStore**: durable entity and app records (owner node, status, history).
//! - **EntityFactory**: builds the work entity for an id and hands out the retriever it uses.
//! - **Retriever**: bulk access to persisted schedules, used for replaying missed work.

pub mod memory;
pub mod types;


use crate::supervisor::entity::Entity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use types::{ActionType, App, EntityId, EntityInfo, EntityStatus, ScheduleStatus};

/// Persisted cluster state. Implementations provide their own thread-safety.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_all_entities_info(&self) -> anyhow::Result<Vec<EntityInfo>>;

    async fn get_all_entities_info_of_node(&self, node: &str) -> anyhow::Result<Vec<EntityInfo>>;

    async fn get_app(&self, app_id: &str) -> anyhow::Result<App>;

    async fn update_entity_status(
        &self,
        id: &EntityId,
        node: &str,
        status: EntityStatus,
    ) -> anyhow::Result<()>;

    async fn invalidate_single_app_cache(&self, app_id: &str);
}

/// Bulk operations over the schedules of one app partition.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn bulk_action(
        &self,
        app: &App,
        partition: u32,
        time_bucket: DateTime<Utc>,
        statuses: &[ScheduleStatus],
        action: ActionType,
    ) -> anyhow::Result<()>;
}

pub trait EntityFactory: Send + Sync {
    fn create_entity(&self, id: &EntityId) -> anyhow::Result<Arc<dyn Entity>>;

    fn entity_retriever(&self, app_id: &str) -> Arc<dyn Retriever>;
}
