//! Entities and relations.

use crate::attribute::AttributeValue;
use crate::id::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A synchronizable record.
///
/// The descriptor names the concrete type; everything type-specific lives in
/// the attribute bag. Relations form a set keyed by `(name, related id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Concrete type of the record.
    pub type_descriptor: String,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Last modification time (UTC). Never decreases across stored versions.
    pub modified_at: DateTime<Utc>,
    /// Soft-delete flag.
    #[serde(default)]
    pub archived: bool,
    /// True once the authoritative side has accepted this version.
    #[serde(default)]
    pub synced: bool,
    /// Outgoing relations.
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Attribute bag.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Entity {
    /// Creates a new entity of the given type with a fresh id.
    pub fn new(type_descriptor: impl Into<String>) -> Self {
        Self::with_id(EntityId::new(), type_descriptor)
    }

    /// Creates a new entity with an explicit id.
    pub fn with_id(id: EntityId, type_descriptor: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            type_descriptor: type_descriptor.into(),
            created_at: now,
            modified_at: now,
            archived: false,
            synced: false,
            relations: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets an attribute, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Gets an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Removes an attribute, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    /// Gets a text attribute.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_text)
    }

    /// Gets an integer attribute.
    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttributeValue::as_integer)
    }

    /// Returns true if a relation `(name, related_id)` exists.
    pub fn has_relation(&self, name: &str, related_id: EntityId) -> bool {
        self.relations
            .iter()
            .any(|r| r.name == name && r.related.id == related_id)
    }

    /// Adds a one-way relation to `related`.
    ///
    /// Returns false if the `(name, related id)` pair is already present.
    pub fn relate(&mut self, name: impl Into<String>, related: Entity) -> bool {
        let name = name.into();
        if self.has_relation(&name, related.id) {
            return false;
        }
        self.relations.push(Relation::new(self.id, name, related));
        true
    }

    /// Adds a relation to `related`, and the inverse relation on `related`
    /// when `inverse_name` is given.
    ///
    /// Each side holds its own snapshot of the other, so the two relations
    /// are independent records. The forward snapshot already contains the
    /// inverse relation.
    pub fn add_relation(
        &mut self,
        related: &mut Entity,
        name: impl Into<String>,
        inverse_name: Option<&str>,
    ) -> bool {
        let name = name.into();
        if self.has_relation(&name, related.id) {
            return false;
        }
        if let Some(inverse) = inverse_name {
            related.relate(inverse, self.clone());
        }
        self.relations
            .push(Relation::new(self.id, name, related.clone()));
        true
    }

    /// Removes the relation `(name, related_id)`.
    pub fn remove_relation(&mut self, name: &str, related_id: EntityId) -> bool {
        let before = self.relations.len();
        self.relations
            .retain(|r| !(r.name == name && r.related.id == related_id));
        before != self.relations.len()
    }

    /// Iterates over entities related under `name`.
    pub fn related<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.relations
            .iter()
            .filter(move |r| r.name == name)
            .map(|r| r.related.as_ref())
    }

    /// Returns a copy without relations.
    pub fn detached(&self) -> Entity {
        Entity {
            relations: Vec::new(),
            ..self.clone()
        }
    }

    /// Marks the entity as modified now and not yet accepted remotely.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
        self.synced = false;
    }
}

/// A named, directed link from one entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// The relation's own identifier.
    pub id: EntityId,
    /// Relation name, e.g. `"Addresses"`.
    pub name: String,
    /// The owning entity.
    pub owner_id: EntityId,
    /// The related entity.
    pub related: Box<Entity>,
}

impl Relation {
    /// Creates a relation with a fresh id.
    pub fn new(owner_id: EntityId, name: impl Into<String>, related: Entity) -> Self {
        Self {
            id: EntityId::new(),
            name: name.into(),
            owner_id,
            related: Box::new(related),
        }
    }
}
