use super::ClusterStore;
use super::types::{App, EntityId, EntityInfo, EntityStatus};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory `ClusterStore`.
///
/// App reads go through a cache that is only filled on first read, so a
/// changed app record stays invisible until `invalidate_single_app_cache`.
pub struct InMemoryClusterStore {
    entities: DashMap<EntityId, EntityInfo>,
    apps: DashMap<String, App>,
    app_cache: DashMap<String, App>,
    history_max_len: usize,
}

impl InMemoryClusterStore {
    pub fn new(history_max_len: usize) -> Self {
        Self {
            entities: DashMap::new(),
            apps: DashMap::new(),
            app_cache: DashMap::new(),
            history_max_len,
        }
    }

    /// Inserts or replaces an app record, dropping any cached copy.
    pub fn put_app(&self, app: App) {
        self.app_cache.remove(&app.app_id);
        self.apps.insert(app.app_id.clone(), app);
    }

    /// Rewrites the backing app record only. Readers keep seeing the cached
    /// copy until the cache entry is invalidated.
    pub fn update_app(&self, app: App) {
        self.apps.insert(app.app_id.clone(), app);
    }

    pub fn put_entity(&self, info: EntityInfo) {
        self.entities.insert(info.id.clone(), info);
    }

    pub fn entity(&self, id: &EntityId) -> Option<EntityInfo> {
        self.entities.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_app_cached(&self, app_id: &str) -> bool {
        self.app_cache.contains_key(app_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl Default for InMemoryClusterStore {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn get_all_entities_info(&self) -> Result<Vec<EntityInfo>> {
        let mut infos: Vec<EntityInfo> = self
            .entities
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    async fn get_all_entities_info_of_node(&self, node: &str) -> Result<Vec<EntityInfo>> {
        let mut infos: Vec<EntityInfo> = self
            .entities
            .iter()
            .filter(|entry| entry.value().node == node)
            .map(|entry| entry.value().clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    async fn get_app(&self, app_id: &str) -> Result<App> {
        if let Some(cached) = self.app_cache.get(app_id) {
            return Ok(cached.value().clone());
        }

        let app = self
            .apps
            .get(app_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("App {} not found", app_id))?;

        self.app_cache.insert(app_id.to_string(), app.clone());
        Ok(app)
    }

    async fn update_entity_status(
        &self,
        id: &EntityId,
        node: &str,
        status: EntityStatus,
    ) -> Result<()> {
        let mut entry = self
            .entities
            .entry(id.clone())
            .or_insert_with(|| EntityInfo::new(id.clone(), node, EntityStatus::Stopped));
        entry.record_transition(node, status, self.history_max_len);

        tracing::debug!("Persisted {} -> {:?} on {}", id, status, node);
        Ok(())
    }

    async fn invalidate_single_app_cache(&self, app_id: &str) {
        if self.app_cache.remove(app_id).is_some() {
            tracing::debug!("Invalidated cached app {}", app_id);
        }
    }
}
