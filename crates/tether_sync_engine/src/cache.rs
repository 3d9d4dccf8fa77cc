//! In-memory entity cache.

use crate::error::SyncResult;
use dashmap::DashMap;
use std::collections::HashMap;
use tether_model::{Entity, EntityId};
use tether_storage::{EntityStore, Query};
use tracing::debug;

/// Recently used entities, grouped by type descriptor.
///
/// Owned by whoever constructs it; nothing here is process-global.
#[derive(Debug, Default)]
pub struct EntityCache {
    types: DashMap<String, HashMap<EntityId, Entity>>,
}

impl EntityCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the newest `take` live entities of `type_descriptor` from `store`.
    ///
    /// Returns the number of entities cached.
    pub fn warm<S: EntityStore + ?Sized>(
        &self,
        store: &S,
        type_descriptor: &str,
        take: usize,
    ) -> SyncResult<usize> {
        let entities = store.get_first(type_descriptor, take, 0, Some(&Query::live()), false)?;
        let count = entities.len();
        for entity in entities {
            self.add_or_update(entity);
        }
        debug!(type_descriptor, count, "cache warmed");
        Ok(count)
    }

    /// Inserts or replaces an entity.
    pub fn add_or_update(&self, entity: Entity) {
        self.types
            .entry(entity.type_descriptor.clone())
            .or_default()
            .insert(entity.id, entity);
    }

    /// Evicts an entity. Returns true if it was cached.
    pub fn remove(&self, type_descriptor: &str, id: EntityId) -> bool {
        self.types
            .get_mut(type_descriptor)
            .is_some_and(|mut entities| entities.remove(&id).is_some())
    }

    /// Looks up one entity.
    pub fn get_by_id(&self, type_descriptor: &str, id: EntityId) -> Option<Entity> {
        self.types
            .get(type_descriptor)
            .and_then(|entities| entities.get(&id).cloned())
    }

    /// A page of live entities, newest first.
    pub fn get(&self, type_descriptor: &str, take: usize, skip: usize) -> Vec<Entity> {
        let Some(entities) = self.types.get(type_descriptor) else {
            return Vec::new();
        };
        let mut live: Vec<&Entity> = entities.values().filter(|e| !e.archived).collect();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        live.into_iter().skip(skip).take(take).cloned().collect()
    }

    /// Number of cached entities of all types.
    pub fn len(&self) -> usize {
        self.types.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.types.clear();
    }
}
