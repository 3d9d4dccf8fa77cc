//! # Tether Model
//!
//! Entity model shared by clients and servers.
//!
//! This crate provides:
//! - `EntityId` (UUID-backed identifiers)
//! - `Entity` with its attribute bag and relation set
//! - `ImageAttachment` binary blobs
//! - `TypeRegistry` for typed views and polymorphic casting
//!
//! ## Casting
//!
//! ```
//! use tether_model::{AttributeKind, Entity, TypeRegistry, TypeShape};
//!
//! let mut registry = TypeRegistry::new();
//! registry.register_shape(TypeShape::new("Person").attribute("age", AttributeKind::Float));
//!
//! let person = Entity::new("Person").with("age", 36);
//! let cast = registry.cast_as(&person, "Person", true).unwrap();
//! assert_eq!(cast.get("age").and_then(|v| v.as_float()), Some(36.0));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attribute;
mod entity;
mod error;
mod id;
mod image;
mod registry;

pub use attribute::{AttributeKind, AttributeValue};
pub use entity::{Entity, Relation};
pub use error::{ModelError, ModelResult};
pub use id::EntityId;
pub use image::{ImageAttachment, IMAGE_TYPE};
pub use registry::{
    text_attribute, EntityType, TypeRegistry, TypeShape, BASE_TYPE, MAX_CAST_DEPTH,
};
