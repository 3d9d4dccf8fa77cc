//! Property-based test generators using proptest.
//!
//! Generated values are always valid: type names are non-empty, floats are
//! finite and timestamps sit in a plausible range.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tether_model::{AttributeValue, Entity, EntityId};
use tether_sync_protocol::{FetchSpec, PackageMethod, WirePackage};

/// Strategy for generating entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = EntityId> {
    prop::array::uniform16(any::<u8>()).prop_map(EntityId::from_bytes)
}

/// Strategy for generating type descriptors.
pub fn type_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9]{0,15}").expect("Invalid regex")
}

/// Strategy for generating attribute names.
pub fn attribute_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z]{0,11}").expect("Invalid regex")
}

/// Strategy for generating UTC timestamps between 2001 and 2033, at
/// millisecond precision.
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_000_000_000_000i64..2_000_000_000_000i64).prop_map(|millis| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

/// Strategy for generating attribute values of every kind.
pub fn attribute_value_strategy() -> impl Strategy<Value = AttributeValue> {
    prop_oneof![
        Just(AttributeValue::Null),
        any::<bool>().prop_map(AttributeValue::Bool),
        any::<i64>().prop_map(AttributeValue::Integer),
        (-1.0e12f64..1.0e12f64).prop_map(AttributeValue::Float),
        ".{0,32}".prop_map(AttributeValue::Text),
        timestamp_strategy().prop_map(AttributeValue::Timestamp),
        entity_id_strategy().prop_map(AttributeValue::Id),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(AttributeValue::Bytes),
    ]
}

/// Strategy for generating relation-free entities of `type_descriptor`.
pub fn entity_strategy(type_descriptor: &str) -> impl Strategy<Value = Entity> {
    let type_descriptor = type_descriptor.to_string();
    (
        entity_id_strategy(),
        timestamp_strategy(),
        0i64..1_000_000,
        any::<bool>(),
        prop::collection::btree_map(attribute_name_strategy(), attribute_value_strategy(), 0..6),
    )
        .prop_map(
            move |(id, created_at, later_ms, archived, attributes): (
                EntityId,
                DateTime<Utc>,
                i64,
                bool,
                BTreeMap<String, AttributeValue>,
            )| {
                let mut entity = Entity::with_id(id, type_descriptor.clone());
                entity.created_at = created_at;
                entity.modified_at = created_at + chrono::Duration::milliseconds(later_ms);
                entity.archived = archived;
                entity.attributes = attributes;
                entity
            },
        )
}

/// Strategy for generating fetch requests.
pub fn fetch_spec_strategy() -> impl Strategy<Value = FetchSpec> {
    (
        type_name_strategy(),
        0u32..500,
        0u32..500,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(type_descriptor, take, skip, include_all, ids_only)| {
            let spec = FetchSpec::new(type_descriptor)
                .with_page(take, skip)
                .with_include_all(include_all);
            if ids_only {
                spec.ids_only()
            } else {
                spec
            }
        })
}

/// Strategy for generating command and fetch packages.
pub fn wire_package_strategy() -> impl Strategy<Value = WirePackage> {
    let command = (
        prop_oneof![
            Just(PackageMethod::Insert),
            Just(PackageMethod::Update),
            Just(PackageMethod::Delete),
        ],
        type_name_strategy().prop_flat_map(|name| entity_strategy(&name)),
    )
        .prop_map(|(method, entity)| WirePackage::command(method, entity));
    let fetch = fetch_spec_strategy().prop_map(WirePackage::fetch);

    (prop_oneof![command, fetch], prop::option::of("[a-z]{1,12}")).prop_map(
        |(package, client_id)| match client_id {
            Some(client_id) => package.with_client_id(client_id),
            None => package,
        },
    )
}
