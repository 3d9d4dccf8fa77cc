//! Typed fixtures and common test settings.

use chrono::{Duration as TimeDelta, Utc};
use std::time::Duration;
use tether_model::{AttributeKind, Entity, EntityType, TypeRegistry, TypeShape};
use tether_transport::{GuardConfig, TransportConfig};

/// A person record.
#[derive(Debug, Clone, PartialEq)]
pub struct Person(Entity);

impl Person {
    /// Creates a person with a fresh id.
    pub fn new(name: &str, age: i64) -> Self {
        Self(
            Entity::new(Self::TYPE_NAME)
                .with("Name", name)
                .with("Age", age),
        )
    }

    /// The person's name.
    pub fn name(&self) -> Option<&str> {
        self.0.text("Name")
    }

    /// The person's age.
    pub fn age(&self) -> Option<i64> {
        self.0.integer("Age")
    }
}

impl EntityType for Person {
    const TYPE_NAME: &'static str = "Person";

    fn shape() -> TypeShape {
        TypeShape::new(Self::TYPE_NAME)
            .attribute("Name", AttributeKind::Text)
            .attribute("Age", AttributeKind::Integer)
    }

    fn from_entity(entity: Entity) -> Self {
        Self(entity)
    }

    fn as_entity(&self) -> &Entity {
        &self.0
    }

    fn into_entity(self) -> Entity {
        self.0
    }
}

/// A postal address, usually related to a [`Person`].
#[derive(Debug, Clone, PartialEq)]
pub struct Address(Entity);

impl Address {
    /// Creates an address with a fresh id.
    pub fn new(street: &str, zip: &str) -> Self {
        Self(
            Entity::new(Self::TYPE_NAME)
                .with("Street", street)
                .with("Zip", zip),
        )
    }

    /// The street line.
    pub fn street(&self) -> Option<&str> {
        self.0.text("Street")
    }
}

impl EntityType for Address {
    const TYPE_NAME: &'static str = "Address";

    fn shape() -> TypeShape {
        TypeShape::new(Self::TYPE_NAME)
            .attribute("Street", AttributeKind::Text)
            .attribute("Zip", AttributeKind::Text)
    }

    fn from_entity(entity: Entity) -> Self {
        Self(entity)
    }

    fn as_entity(&self) -> &Entity {
        &self.0
    }

    fn into_entity(self) -> Entity {
        self.0
    }
}

/// A registry that knows [`Person`] and [`Address`].
pub fn sample_registry() -> TypeRegistry {
    TypeRegistry::new().with::<Person>().with::<Address>()
}

/// An untyped person entity.
pub fn person(name: &str, age: i64) -> Entity {
    Person::new(name, age).into_entity()
}

/// An untyped address entity.
pub fn address(street: &str, zip: &str) -> Entity {
    Address::new(street, zip).into_entity()
}

/// Moves both timestamps of `entity` into the past.
pub fn aged(mut entity: Entity, minutes_ago: i64) -> Entity {
    let at = Utc::now() - TimeDelta::minutes(minutes_ago);
    entity.created_at = at;
    entity.modified_at = at;
    entity
}

/// Transport settings with short probe and stall timings.
pub fn fast_transport_config() -> TransportConfig {
    TransportConfig::default()
        .with_send_buffer_size(256)
        .with_stall_timeout(Duration::from_millis(500))
        .with_guard(
            GuardConfig::default()
                .with_first_probe(Duration::from_millis(20))
                .with_interval(Duration::from_millis(50))
                .with_poll_timeout(Duration::from_millis(20)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_fixtures_conform_through_the_registry() {
        let registry = sample_registry();
        assert!(registry.contains("Person"));
        assert!(registry.contains("Address"));

        let ada = Person::new("Ada", 36);
        assert_eq!(ada.name(), Some("Ada"));
        assert_eq!(ada.age(), Some(36));

        let cast: Person = registry.cast(ada.as_entity(), false).unwrap();
        assert_eq!(cast.name(), Some("Ada"));
    }

    #[test]
    fn aged_moves_both_timestamps() {
        let entity = aged(address("Main St 1", "12345"), 30);
        assert_eq!(entity.created_at, entity.modified_at);
        assert!(entity.modified_at < Utc::now() - TimeDelta::minutes(29));
    }
}
