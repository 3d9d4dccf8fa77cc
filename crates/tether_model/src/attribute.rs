//! Dynamic attribute values.
//!
//! Entities carry their domain fields in an attribute bag. Each value is
//! tagged with its kind on the wire (`{type, value}`), so a receiver that
//! does not know the entity's concrete type can still read it.

use crate::id::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    /// No value.
    Null,
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// UTF-8 text.
    Text,
    /// UTC timestamp.
    Timestamp,
    /// Entity identifier.
    Id,
    /// Raw bytes.
    Bytes,
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AttributeValue {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Entity identifier.
    Id(EntityId),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl AttributeValue {
    /// Returns the kind of this value.
    pub fn kind(&self) -> AttributeKind {
        match self {
            AttributeValue::Null => AttributeKind::Null,
            AttributeValue::Bool(_) => AttributeKind::Bool,
            AttributeValue::Integer(_) => AttributeKind::Integer,
            AttributeValue::Float(_) => AttributeKind::Float,
            AttributeValue::Text(_) => AttributeKind::Text,
            AttributeValue::Timestamp(_) => AttributeKind::Timestamp,
            AttributeValue::Id(_) => AttributeKind::Id,
            AttributeValue::Bytes(_) => AttributeKind::Bytes,
        }
    }

    /// Converts this value to `kind`, if a lossless conversion exists.
    ///
    /// `Null` fits every kind.
    pub fn coerce(self, kind: AttributeKind) -> Option<AttributeValue> {
        if self.kind() == kind || matches!(self, AttributeValue::Null) {
            return Some(self);
        }
        match (self, kind) {
            (AttributeValue::Integer(i), AttributeKind::Float) => Some(AttributeValue::Float(i as f64)),
            (AttributeValue::Float(f), AttributeKind::Integer)
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 =>
            {
                Some(AttributeValue::Integer(f as i64))
            }
            (AttributeValue::Integer(i), AttributeKind::Text) => Some(AttributeValue::Text(i.to_string())),
            (AttributeValue::Bool(b), AttributeKind::Text) => Some(AttributeValue::Text(b.to_string())),
            (AttributeValue::Id(id), AttributeKind::Text) => Some(AttributeValue::Text(id.to_string())),
            (AttributeValue::Timestamp(t), AttributeKind::Text) => {
                Some(AttributeValue::Text(t.to_rfc3339()))
            }
            (AttributeValue::Text(s), AttributeKind::Id) => s.parse().ok().map(AttributeValue::Id),
            (AttributeValue::Text(s), AttributeKind::Timestamp) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| AttributeValue::Timestamp(t.with_timezone(&Utc))),
            (AttributeValue::Text(s), AttributeKind::Integer) => s.parse().ok().map(AttributeValue::Integer),
            (AttributeValue::Text(s), AttributeKind::Bool) => s.parse().ok().map(AttributeValue::Bool),
            _ => None,
        }
    }

    /// Returns the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float, widening integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is a timestamp value.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns the identifier, if this is an id value.
    pub fn as_id(&self) -> Option<EntityId> {
        match self {
            AttributeValue::Id(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Integer(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttributeValue::Timestamp(v)
    }
}

impl From<EntityId> for AttributeValue {
    fn from(v: EntityId) -> Self {
        AttributeValue::Id(v)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(v: Vec<u8>) -> Self {
        AttributeValue::Bytes(v)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(AttributeValue::Null, Into::into)
    }
}
