//! Error types for the entity model.

use crate::attribute::AttributeKind;
use tether_codec::CodecError;
use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while shaping or casting entities.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The type descriptor is not registered.
    #[error("unknown type descriptor: {0}")]
    UnknownType(String),

    /// An attribute does not fit the kind declared by the target type.
    #[error("attribute '{name}' of {type_name}: expected {expected:?}, found {found:?}")]
    AttributeType {
        /// Target type descriptor.
        type_name: String,
        /// Attribute name.
        name: String,
        /// Declared kind.
        expected: AttributeKind,
        /// Kind found on the entity.
        found: AttributeKind,
    },

    /// A type's parent chain loops back on itself.
    #[error("type hierarchy of {0} is cyclic")]
    CyclicHierarchy(String),

    /// Re-encoding the entity failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::UnknownType("Invoice".into());
        assert_eq!(err.to_string(), "unknown type descriptor: Invoice");

        let err = ModelError::AttributeType {
            type_name: "Person".into(),
            name: "age".into(),
            expected: AttributeKind::Integer,
            found: AttributeKind::Text,
        };
        assert!(err.to_string().contains("age"));
        assert!(err.to_string().contains("Person"));
    }
}
