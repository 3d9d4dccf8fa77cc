//! Store traits.

use crate::error::StorageResult;
use crate::query::Query;
use tether_model::{Entity, EntityId, ImageAttachment};

/// Persistent entity store.
///
/// Implementations must be safe to share across tasks. Listing operations
/// return entities ordered by `created_at`, newest first.
pub trait EntityStore: Send + Sync {
    /// Prepares storage for `type_descriptor`. Idempotent.
    fn ensure_schema(&self, type_descriptor: &str) -> StorageResult<()>;

    /// Inserts a new entity together with any related entities that are not
    /// stored yet.
    fn create(&self, entity: &Entity) -> StorageResult<()>;

    /// Replaces a stored entity and its relation set.
    fn update(&self, entity: &Entity) -> StorageResult<()>;

    /// Deletes by id. Returns false if nothing was stored.
    fn delete(&self, type_descriptor: &str, id: EntityId) -> StorageResult<bool>;

    /// Loads one entity, optionally with its relation graph.
    fn get_by_id(
        &self,
        type_descriptor: &str,
        id: EntityId,
        include_relations: bool,
    ) -> StorageResult<Option<Entity>>;

    /// Loads a page of entities matching `predicate`.
    fn get_first(
        &self,
        type_descriptor: &str,
        take: usize,
        skip: usize,
        predicate: Option<&Query>,
        include_relations: bool,
    ) -> StorageResult<Vec<Entity>>;

    /// Lists at most `max` ids matching `predicate`.
    fn get_ids(
        &self,
        type_descriptor: &str,
        predicate: Option<&Query>,
        max: usize,
    ) -> StorageResult<Vec<EntityId>>;

    /// Inserts or replaces.
    fn upsert(&self, entity: &Entity) -> StorageResult<()> {
        if self
            .get_by_id(&entity.type_descriptor, entity.id, false)?
            .is_some()
        {
            self.update(entity)
        } else {
            self.create(entity)
        }
    }
}

/// Persistent attachment store.
pub trait ImageStore: Send + Sync {
    /// Inserts or replaces an attachment.
    fn save_image(&self, image: &ImageAttachment) -> StorageResult<()>;

    /// Deletes an attachment. Returns false if nothing was stored.
    fn delete_image(&self, id: EntityId) -> StorageResult<bool>;

    /// Attachments belonging to `relation_id`, newest first.
    fn images_for(&self, relation_id: EntityId) -> StorageResult<Vec<ImageAttachment>>;

    /// Attachments not yet accepted by the remote side.
    fn unsynced_images(&self) -> StorageResult<Vec<ImageAttachment>>;
}
