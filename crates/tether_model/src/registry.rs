//! Type registry and polymorphic casting.
//!
//! Entities travel as attribute bags. The registry knows, for every type
//! descriptor, which attributes the type declares and which type it extends.
//! Casting re-encodes an entity through the codec and conforms its
//! attributes to the target shape, then walks the relation graph and
//! re-types every related entity the same way.

use crate::attribute::{AttributeKind, AttributeValue};
use crate::entity::Entity;
use crate::error::{ModelError, ModelResult};
use crate::id::EntityId;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Descriptor of the root type every entity extends.
pub const BASE_TYPE: &str = "Entity";

/// Relation depth at which casting stops re-typing.
pub const MAX_CAST_DEPTH: usize = 10;

/// Declared shape of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeShape {
    /// Type descriptor.
    pub name: String,
    /// Parent type descriptor (`None` only for the base type).
    pub parent: Option<String>,
    /// Attributes declared by this type, excluding inherited ones.
    pub attributes: BTreeMap<String, AttributeKind>,
}

impl TypeShape {
    /// Creates a shape extending the base type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(BASE_TYPE.to_string()),
            attributes: BTreeMap::new(),
        }
    }

    /// Sets the parent type.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares an attribute.
    pub fn attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(name.into(), kind);
        self
    }

    fn base() -> Self {
        Self {
            name: BASE_TYPE.to_string(),
            parent: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// A statically typed view over an [`Entity`].
///
/// Implementors are thin wrappers whose accessors read and write the
/// attribute bag, so a typed value and its entity never disagree.
pub trait EntityType: Sized {
    /// Type descriptor.
    const TYPE_NAME: &'static str;

    /// Declared shape of the type.
    fn shape() -> TypeShape;

    /// Wraps an entity already conformed to this type.
    fn from_entity(entity: Entity) -> Self;

    /// Borrows the underlying entity.
    fn as_entity(&self) -> &Entity;

    /// Unwraps the underlying entity.
    fn into_entity(self) -> Entity;
}

/// Registry mapping type descriptors to their shapes.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    shapes: HashMap<String, TypeShape>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry containing only the base type.
    pub fn new() -> Self {
        let mut shapes = HashMap::new();
        shapes.insert(BASE_TYPE.to_string(), TypeShape::base());
        Self { shapes }
    }

    /// Registers a shape, replacing any previous one with the same name.
    pub fn register_shape(&mut self, shape: TypeShape) {
        self.shapes.insert(shape.name.clone(), shape);
    }

    /// Registers a typed view.
    pub fn register<T: EntityType>(&mut self) {
        self.register_shape(T::shape());
    }

    /// Builder-style registration.
    pub fn with<T: EntityType>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.shapes.contains_key(name)
    }

    /// Gets a shape by descriptor.
    pub fn get(&self, name: &str) -> Option<&TypeShape> {
        self.shapes.get(name)
    }

    /// Returns the chain from `name` up to the base type.
    pub fn lineage(&self, name: &str) -> ModelResult<Vec<&TypeShape>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);
        while let Some(type_name) = current {
            if !seen.insert(type_name) {
                return Err(ModelError::CyclicHierarchy(name.to_string()));
            }
            let shape = self
                .shapes
                .get(type_name)
                .ok_or_else(|| ModelError::UnknownType(type_name.to_string()))?;
            chain.push(shape);
            current = shape.parent.as_deref();
        }
        Ok(chain)
    }

    /// Returns true if `name` is `ancestor` or extends it.
    pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
        self.lineage(name)
            .map(|chain| chain.iter().any(|s| s.name == ancestor))
            .unwrap_or(false)
    }

    /// Every attribute declared by `name` or its ancestors.
    pub fn declared_attributes(&self, name: &str) -> ModelResult<BTreeMap<String, AttributeKind>> {
        let mut merged = BTreeMap::new();
        // Walk base-first so subtypes override inherited declarations.
        for shape in self.lineage(name)?.into_iter().rev() {
            for (attr, kind) in &shape.attributes {
                merged.insert(attr.clone(), *kind);
            }
        }
        Ok(merged)
    }

    /// Re-encodes a single entity (relations excluded) as `type_name`.
    ///
    /// Declared attributes are coerced to their declared kind; undeclared
    /// attributes are carried through untouched.
    pub fn conform(&self, entity: &Entity, type_name: &str) -> ModelResult<Entity> {
        let declared = self.declared_attributes(type_name)?;
        let mut shaped: Entity = tether_codec::transcode(&entity.detached())?;
        for (name, kind) in declared {
            let Some(value) = shaped.attributes.remove(&name) else {
                continue;
            };
            let found = value.kind();
            let coerced = value.coerce(kind).ok_or_else(|| ModelError::AttributeType {
                type_name: type_name.to_string(),
                name: name.clone(),
                expected: kind,
                found,
            })?;
            shaped.attributes.insert(name, coerced);
        }
        Ok(shaped)
    }

    /// Casts `entity` to `target`, returning `None` on failure.
    ///
    /// With `downcast` every related entity is re-typed to its own
    /// descriptor; otherwise related entities are re-typed to the base type.
    pub fn cast_as(&self, entity: &Entity, target: &str, downcast: bool) -> Option<Entity> {
        self.cast_from_depth(entity, target, downcast, 1)
    }

    /// Like [`cast_as`](Self::cast_as), treating `entity` as sitting at
    /// relation depth `depth`.
    pub fn cast_from_depth(
        &self,
        entity: &Entity,
        target: &str,
        downcast: bool,
        depth: usize,
    ) -> Option<Entity> {
        match self.try_cast(entity, target, downcast, depth) {
            Ok(cast) => Some(cast),
            Err(e) => {
                debug!(entity_id = %entity.id, target, error = %e, "cast failed");
                None
            }
        }
    }

    /// Casts into a typed view.
    pub fn cast<T: EntityType>(&self, entity: &Entity, downcast: bool) -> Option<T> {
        self.cast_as(entity, T::TYPE_NAME, downcast)
            .map(T::from_entity)
    }

    /// Fallible cast over the relation graph.
    ///
    /// Nodes at depth [`MAX_CAST_DEPTH`] or beyond, and nodes whose id was
    /// already re-typed earlier in the walk, are left exactly as they are.
    pub fn try_cast(
        &self,
        entity: &Entity,
        target: &str,
        downcast: bool,
        depth: usize,
    ) -> ModelResult<Entity> {
        if !self.contains(target) {
            return Err(ModelError::UnknownType(target.to_string()));
        }

        let mut root = entity.clone();
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut work: Vec<(&mut Entity, String, usize)> = vec![(&mut root, target.to_string(), depth)];

        while let Some((node, type_name, level)) = work.pop() {
            if level >= MAX_CAST_DEPTH || !visited.insert(node.id) {
                continue;
            }

            let relations = std::mem::take(&mut node.relations);
            *node = self.conform(node, &type_name)?;
            node.relations = relations;

            let owner_id = node.id;
            for relation in &mut node.relations {
                relation.owner_id = owner_id;
                let next_type = if downcast {
                    relation.related.type_descriptor.clone()
                } else {
                    BASE_TYPE.to_string()
                };
                work.push((relation.related.as_mut(), next_type, level + 1));
            }
        }

        Ok(root)
    }
}

/// Returns the value of `name` coerced to text, for typed accessors.
pub fn text_attribute(entity: &Entity, name: &str) -> Option<String> {
    entity
        .get(name)
        .cloned()
        .and_then(|v| v.coerce(AttributeKind::Text))
        .and_then(|v| match v {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register_shape(
            TypeShape::new("Person")
                .attribute("name", AttributeKind::Text)
                .attribute("score", AttributeKind::Float),
        );
        registry.register_shape(
            TypeShape::new("Employee")
                .extends("Person")
                .attribute("badge", AttributeKind::Integer),
        );
        registry.register_shape(TypeShape::new("Address").attribute("zip", AttributeKind::Text));
        registry.register_shape(TypeShape::new("Node").attribute("rank", AttributeKind::Float));
        registry
    }

    #[test]
    fn lineage_walks_to_base() {
        let registry = registry();
        let names: Vec<_> = registry
            .lineage("Employee")
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(names, vec!["Employee", "Person", BASE_TYPE]);
        assert!(registry.is_subtype("Employee", "Person"));
        assert!(!registry.is_subtype("Person", "Employee"));
    }

    #[test]
    fn cyclic_hierarchy_detected() {
        let mut registry = TypeRegistry::new();
        registry.register_shape(TypeShape::new("A").extends("B"));
        registry.register_shape(TypeShape::new("B").extends("A"));
        assert_eq!(
            registry.lineage("A").unwrap_err(),
            ModelError::CyclicHierarchy("A".into())
        );
    }

    #[test]
    fn declared_attributes_are_inherited() {
        let attrs = registry().declared_attributes("Employee").unwrap();
        assert_eq!(attrs.get("name"), Some(&AttributeKind::Text));
        assert_eq!(attrs.get("badge"), Some(&AttributeKind::Integer));
    }

    #[test]
    fn conform_coerces_declared_attributes() {
        let entity = Entity::new("Person").with("score", 3).with("nickname", "A");
        let shaped = registry().conform(&entity, "Person").unwrap();
        assert_eq!(shaped.get("score"), Some(&AttributeValue::Float(3.0)));
        assert_eq!(shaped.text("nickname"), Some("A"));
        assert_eq!(shaped.id, entity.id);
        assert_eq!(shaped.modified_at, entity.modified_at);
    }

    #[test]
    fn unknown_target_yields_none() {
        let entity = Entity::new("Person");
        assert!(registry().cast_as(&entity, "Invoice", true).is_none());
    }

    #[test]
    fn incompatible_attribute_yields_none() {
        let entity = Entity::new("Person").with("score", "high");
        assert!(registry().cast_as(&entity, "Person", true).is_none());
    }

    #[test]
    fn downcast_retypes_related_to_own_type() {
        let mut person = Entity::new("Person").with("name", "Ada");
        let mut address = Entity::new("Address").with("zip", 1234);
        person.add_relation(&mut address, "Addresses", Some("Persons"));

        let cast = registry().cast_as(&person, "Person", true).unwrap();
        let related = cast.related("Addresses").next().unwrap();
        assert_eq!(related.get("zip"), Some(&AttributeValue::Text("1234".into())));
        assert_eq!(cast.relations[0].owner_id, person.id);
    }

    #[test]
    fn upcast_retypes_related_to_base() {
        let mut person = Entity::new("Person");
        let mut address = Entity::new("Address").with("zip", 1234);
        person.add_relation(&mut address, "Addresses", None);

        let cast = registry().cast_as(&person, "Person", false).unwrap();
        let related = cast.related("Addresses").next().unwrap();
        assert_eq!(related.get("zip"), Some(&AttributeValue::Integer(1234)));
        assert_eq!(related.type_descriptor, "Address");
    }

    #[test]
    fn downcast_to_unregistered_related_type_fails() {
        let mut person = Entity::new("Person");
        person.relate("Pets", Entity::new("Dog"));
        let registry = registry();
        assert!(registry.cast_as(&person, "Person", true).is_none());
        assert!(registry.cast_as(&person, "Person", false).is_some());
    }

    #[test]
    fn depth_guard_stops_retyping() {
        // Build a chain n0 -> n1 -> ... -> n14 where every node holds an
        // integer rank that the Node shape declares as float.
        let mut tail = Entity::new("Node").with("rank", 14);
        for i in (0..14).rev() {
            let mut node = Entity::new("Node").with("rank", i);
            node.relate("next", tail);
            tail = node;
        }

        let cast = registry().cast_as(&tail, "Node", true).unwrap();

        let mut node = &cast;
        let mut level = 1;
        loop {
            let rank = node.get("rank").unwrap();
            if level < MAX_CAST_DEPTH {
                assert_eq!(rank.kind(), AttributeKind::Float, "level {level}");
            } else {
                assert_eq!(rank.kind(), AttributeKind::Integer, "level {level}");
            }
            match node.related("next").next() {
                Some(next) => node = next,
                None => break,
            }
            level += 1;
        }
        assert_eq!(level, 15);
    }

    #[test]
    fn repeated_id_is_not_retyped_twice() {
        let mut a = Entity::new("Node").with("rank", 1);
        let mut b = Entity::new("Node").with("rank", 2);
        // a -> b -> a(snapshot)
        a.add_relation(&mut b, "next", Some("next"));

        let cast = registry().cast_as(&a, "Node", true).unwrap();
        let b_cast = cast.related("next").next().unwrap();
        let a_again = b_cast.related("next").next().unwrap();
        assert_eq!(b_cast.get("rank"), Some(&AttributeValue::Float(2.0)));
        assert_eq!(a_again.get("rank"), Some(&AttributeValue::Integer(1)));
    }

    #[test]
    fn cast_from_max_depth_returns_input() {
        let entity = Entity::new("Node").with("rank", 1);
        let cast = registry()
            .cast_from_depth(&entity, "Node", true, MAX_CAST_DEPTH)
            .unwrap();
        assert_eq!(cast, entity);
    }

    #[test]
    fn text_attribute_coerces() {
        let entity = Entity::new("Address").with("zip", 42);
        assert_eq!(text_attribute(&entity, "zip").as_deref(), Some("42"));
        assert_eq!(text_attribute(&entity, "missing"), None);
    }
}
