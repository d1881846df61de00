//! Local Entity Registry
//!
//! Tracks which entities run on *this* node. Entries are ephemeral: they
//! disappear with the process, and "who should own an id" is always answered
//! by the ring and the cluster store, never by this map.

use super::entity::RecoverableEntity;
use crate::store::types::EntityId;

use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of `EntityId -> RecoverableEntity`.
pub struct LocalRegistry {
    entities: DashMap<EntityId, Arc<RecoverableEntity>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<Arc<RecoverableEntity>> {
        self.entities.get(id).map(|entry| entry.value().clone())
    }

    /// Returns the entry for `id`, creating it with `create` when missing.
    /// The shard lock is held while creating, so concurrent callers for the
    /// same id end up sharing one wrapper.
    pub fn get_or_try_insert<E>(
        &self,
        id: &EntityId,
        create: impl FnOnce() -> Result<Arc<RecoverableEntity>, E>,
    ) -> Result<Arc<RecoverableEntity>, E> {
        let entry = self.entities.entry(id.clone()).or_try_insert_with(create)?;
        Ok(entry.value().clone())
    }

    pub fn remove(&self, id: &EntityId) -> Option<Arc<RecoverableEntity>> {
        self.entities.remove(id).map(|(_, entity)| entity)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Snapshot of the registered ids, sorted.
    pub fn keys(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn entities(&self) -> Vec<Arc<RecoverableEntity>> {
        self.entities
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}
