//! Error types for storage operations.

use tether_model::EntityId;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    /// No record with this id and type.
    #[error("{type_descriptor} {id} not found")]
    NotFound {
        /// Requested type descriptor.
        type_descriptor: String,
        /// Requested id.
        id: EntityId,
    },

    /// A record with this id already exists.
    #[error("entity {0} already exists")]
    AlreadyExists(EntityId),

    /// The predicate text could not be parsed.
    #[error("invalid query at {position}: {message}")]
    InvalidQuery {
        /// Byte offset of the offending token.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// The underlying backend failed.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn invalid_query(position: usize, message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            position,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let id = EntityId::nil();
        let err = StorageError::NotFound {
            type_descriptor: "Person".into(),
            id,
        };
        assert_eq!(
            err.to_string(),
            "Person 00000000-0000-0000-0000-000000000000 not found"
        );

        let err = StorageError::invalid_query(4, "expected operator");
        assert!(err.to_string().contains("at 4"));
    }
}
