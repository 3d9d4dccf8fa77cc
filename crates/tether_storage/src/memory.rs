//! In-memory store.

use crate::error::{StorageError, StorageResult};
use crate::query::Query;
use crate::store::{EntityStore, ImageStore};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tether_model::{Entity, EntityId, ImageAttachment, Relation};
use tracing::trace;

/// Depth at which relation graphs stop being resolved on load.
const MAX_RESOLVE_DEPTH: usize = 10;

#[derive(Debug, Clone)]
struct RelationRow {
    id: EntityId,
    name: String,
    related_id: EntityId,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    /// The entity without its relations.
    entity: Entity,
    relations: Vec<RelationRow>,
}

/// An in-memory store.
///
/// Entities are stored flat; relations are kept as rows pointing at other
/// stored entities and re-assembled on load. Suitable for tests, the
/// reference server and ephemeral clients.
///
/// # Example
///
/// ```rust
/// use tether_model::Entity;
/// use tether_storage::{EntityStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// let person = Entity::new("Person").with("name", "Ada");
/// store.create(&person).unwrap();
///
/// let loaded = store.get_by_id("Person", person.id, false).unwrap().unwrap();
/// assert_eq!(loaded.text("name"), Some("Ada"));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entities: RwLock<HashMap<EntityId, StoredEntity>>,
    images: RwLock<HashMap<EntityId, ImageAttachment>>,
    schemas: RwLock<HashSet<String>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities of all types.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Type descriptors passed to `ensure_schema`.
    pub fn schemas(&self) -> Vec<String> {
        let mut names: Vec<_> = self.schemas.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// Writes `root` and inserts every related entity not stored yet.
    fn store_graph(map: &mut HashMap<EntityId, StoredEntity>, root: &Entity) {
        let mut pending: Vec<&Entity> = root.relations.iter().map(|r| r.related.as_ref()).collect();
        map.insert(root.id, flatten(root));

        while let Some(entity) = pending.pop() {
            if map.contains_key(&entity.id) {
                continue;
            }
            trace!(entity_id = %entity.id, "cascading insert of related entity");
            map.insert(entity.id, flatten(entity));
            pending.extend(entity.relations.iter().map(|r| r.related.as_ref()));
        }
    }

    fn resolve(
        map: &HashMap<EntityId, StoredEntity>,
        stored: &StoredEntity,
        depth: usize,
        path: &mut Vec<EntityId>,
    ) -> Entity {
        let mut entity = stored.entity.clone();
        if depth >= MAX_RESOLVE_DEPTH {
            return entity;
        }
        path.push(entity.id);
        for row in &stored.relations {
            let Some(target) = map.get(&row.related_id) else {
                continue;
            };
            let related = if path.contains(&row.related_id) {
                target.entity.clone()
            } else {
                Self::resolve(map, target, depth + 1, path)
            };
            entity.relations.push(Relation {
                id: row.id,
                name: row.name.clone(),
                owner_id: entity.id,
                related: Box::new(related),
            });
        }
        path.pop();
        entity
    }

    fn load(
        map: &HashMap<EntityId, StoredEntity>,
        stored: &StoredEntity,
        include_relations: bool,
    ) -> Entity {
        if include_relations {
            Self::resolve(map, stored, 1, &mut Vec::new())
        } else {
            stored.entity.clone()
        }
    }

    fn matching<'a>(
        map: &'a HashMap<EntityId, StoredEntity>,
        type_descriptor: &str,
        predicate: Option<&Query>,
    ) -> Vec<&'a StoredEntity> {
        let mut found: Vec<_> = map
            .values()
            .filter(|s| s.entity.type_descriptor == type_descriptor)
            .filter(|s| predicate.map_or(true, |q| q.matches(&s.entity)))
            .collect();
        found.sort_by(|a, b| {
            b.entity
                .created_at
                .cmp(&a.entity.created_at)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        found
    }
}

fn flatten(entity: &Entity) -> StoredEntity {
    StoredEntity {
        entity: entity.detached(),
        relations: entity
            .relations
            .iter()
            .map(|r| RelationRow {
                id: r.id,
                name: r.name.clone(),
                related_id: r.related.id,
            })
            .collect(),
    }
}

impl EntityStore for InMemoryStore {
    fn ensure_schema(&self, type_descriptor: &str) -> StorageResult<()> {
        self.schemas.write().insert(type_descriptor.to_string());
        Ok(())
    }

    fn create(&self, entity: &Entity) -> StorageResult<()> {
        let mut map = self.entities.write();
        if map.contains_key(&entity.id) {
            return Err(StorageError::AlreadyExists(entity.id));
        }
        Self::store_graph(&mut map, entity);
        Ok(())
    }

    fn update(&self, entity: &Entity) -> StorageResult<()> {
        let mut map = self.entities.write();
        match map.get(&entity.id) {
            Some(stored) if stored.entity.type_descriptor == entity.type_descriptor => {}
            _ => {
                return Err(StorageError::NotFound {
                    type_descriptor: entity.type_descriptor.clone(),
                    id: entity.id,
                })
            }
        }
        Self::store_graph(&mut map, entity);
        Ok(())
    }

    fn delete(&self, type_descriptor: &str, id: EntityId) -> StorageResult<bool> {
        let mut map = self.entities.write();
        let matches = map
            .get(&id)
            .is_some_and(|s| s.entity.type_descriptor == type_descriptor);
        if !matches {
            return Ok(false);
        }
        map.remove(&id);
        // Drop dangling relation rows pointing at the deleted entity.
        for stored in map.values_mut() {
            stored.relations.retain(|r| r.related_id != id);
        }
        Ok(true)
    }

    fn get_by_id(
        &self,
        type_descriptor: &str,
        id: EntityId,
        include_relations: bool,
    ) -> StorageResult<Option<Entity>> {
        let map = self.entities.read();
        Ok(map
            .get(&id)
            .filter(|s| s.entity.type_descriptor == type_descriptor)
            .map(|s| Self::load(&map, s, include_relations)))
    }

    fn get_first(
        &self,
        type_descriptor: &str,
        take: usize,
        skip: usize,
        predicate: Option<&Query>,
        include_relations: bool,
    ) -> StorageResult<Vec<Entity>> {
        let map = self.entities.read();
        Ok(Self::matching(&map, type_descriptor, predicate)
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|s| Self::load(&map, s, include_relations))
            .collect())
    }

    fn get_ids(
        &self,
        type_descriptor: &str,
        predicate: Option<&Query>,
        max: usize,
    ) -> StorageResult<Vec<EntityId>> {
        let map = self.entities.read();
        Ok(Self::matching(&map, type_descriptor, predicate)
            .into_iter()
            .take(max)
            .map(|s| s.entity.id)
            .collect())
    }
}

impl ImageStore for InMemoryStore {
    fn save_image(&self, image: &ImageAttachment) -> StorageResult<()> {
        self.images.write().insert(image.id, image.clone());
        Ok(())
    }

    fn delete_image(&self, id: EntityId) -> StorageResult<bool> {
        Ok(self.images.write().remove(&id).is_some())
    }

    fn images_for(&self, relation_id: EntityId) -> StorageResult<Vec<ImageAttachment>> {
        let mut found: Vec<_> = self
            .images
            .read()
            .values()
            .filter(|i| i.relation_id == relation_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn unsynced_images(&self) -> StorageResult<Vec<ImageAttachment>> {
        Ok(self
            .images
            .read()
            .values()
            .filter(|i| !i.synced)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn person(name: &str) -> Entity {
        Entity::new("Person").with("name", name)
    }

    #[test]
    fn create_then_get() {
        let store = InMemoryStore::new();
        let p = person("Ada");
        store.create(&p).unwrap();

        assert_eq!(store.get_by_id("Person", p.id, false).unwrap(), Some(p.clone()));
        assert_eq!(store.get_by_id("Address", p.id, false).unwrap(), None);
    }

    #[test]
    fn create_twice_fails() {
        let store = InMemoryStore::new();
        let p = person("Ada");
        store.create(&p).unwrap();
        assert_eq!(store.create(&p), Err(StorageError::AlreadyExists(p.id)));
    }

    #[test]
    fn update_missing_fails() {
        let store = InMemoryStore::new();
        let p = person("Ada");
        assert!(matches!(store.update(&p), Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let store = InMemoryStore::new();
        let mut p = person("Ada");
        store.upsert(&p).unwrap();
        p.set("name", "Grace");
        store.upsert(&p).unwrap();
        let loaded = store.get_by_id("Person", p.id, false).unwrap().unwrap();
        assert_eq!(loaded.text("name"), Some("Grace"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn related_entities_cascade_on_create() {
        let store = InMemoryStore::new();
        let mut p = person("Ada");
        let mut a = Entity::new("Address").with("city", "Oslo");
        p.add_relation(&mut a, "Addresses", Some("Persons"));
        store.create(&p).unwrap();

        let address = store.get_by_id("Address", a.id, false).unwrap().unwrap();
        assert_eq!(address.text("city"), Some("Oslo"));

        let loaded = store.get_by_id("Person", p.id, true).unwrap().unwrap();
        let related: Vec<_> = loaded.related("Addresses").collect();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, a.id);
        // The inverse points back at the person, which is on the load path.
        let back = related[0].related("Persons").next().unwrap();
        assert_eq!(back.id, p.id);
        assert!(back.relations.is_empty());

        let flat = store.get_by_id("Person", p.id, false).unwrap().unwrap();
        assert!(flat.relations.is_empty());
    }

    #[test]
    fn delete_removes_dangling_rows() {
        let store = InMemoryStore::new();
        let mut p = person("Ada");
        let a = Entity::new("Address");
        let a_id = a.id;
        p.relate("Addresses", a);
        store.create(&p).unwrap();

        assert!(!store.delete("Person", a_id).unwrap());
        assert!(store.delete("Address", a_id).unwrap());
        let loaded = store.get_by_id("Person", p.id, true).unwrap().unwrap();
        assert!(loaded.relations.is_empty());
    }

    #[test]
    fn listing_is_newest_first_and_paged() {
        let store = InMemoryStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut p = person(&format!("p{i}"));
            p.created_at = base + Duration::seconds(i);
            ids.push(p.id);
            store.create(&p).unwrap();
        }
        ids.reverse();

        assert_eq!(store.get_ids("Person", None, usize::MAX).unwrap(), ids);
        let page = store.get_first("Person", 2, 1, None, false).unwrap();
        let page_ids: Vec<_> = page.iter().map(|e| e.id).collect();
        assert_eq!(page_ids, ids[1..3].to_vec());
        assert_eq!(store.get_ids("Person", None, 2).unwrap().len(), 2);
    }

    #[test]
    fn predicate_filters() {
        let store = InMemoryStore::new();
        let mut synced = person("a");
        synced.synced = true;
        let unsynced = person("b");
        store.create(&synced).unwrap();
        store.create(&unsynced).unwrap();

        let found = store
            .get_first("Person", usize::MAX, 0, Some(&Query::unsynced()), false)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, unsynced.id);
    }

    #[test]
    fn images_roundtrip() {
        let store = InMemoryStore::new();
        let owner = EntityId::new();
        let mut image = ImageAttachment::new(owner, "Person", vec![1, 2, 3]);
        store.save_image(&image).unwrap();
        assert_eq!(store.unsynced_images().unwrap().len(), 1);

        image.synced = true;
        store.save_image(&image).unwrap();
        assert!(store.unsynced_images().unwrap().is_empty());
        assert_eq!(store.images_for(owner).unwrap(), vec![image.clone()]);

        assert!(store.delete_image(image.id).unwrap());
        assert!(!store.delete_image(image.id).unwrap());
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let store = InMemoryStore::new();
        store.ensure_schema("Person").unwrap();
        store.ensure_schema("Person").unwrap();
        store.ensure_schema("Address").unwrap();
        assert_eq!(store.schemas(), vec!["Address", "Person"]);
    }
}
