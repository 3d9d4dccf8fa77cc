//! Error types for the sync engine.

use std::time::Duration;
use tether_model::{EntityId, ModelError};
use tether_storage::StorageError;
use tether_transport::TransportError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or framing failure.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// No correlated response arrived in time.
    #[error("no response within {after:?}")]
    Timeout {
        /// How long the caller waited.
        after: Duration,
    },

    /// Not connected to the remote authority.
    #[error("not connected to server")]
    NotConnected,

    /// The server answered with a failure.
    #[error("server error: {0}")]
    Remote(String),

    /// The server answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Re-typing or attribute coercion failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// One item could not be reconciled.
    #[error("sync of {type_descriptor} {id} failed: {message}")]
    SyncItem {
        /// Type of the failing item.
        type_descriptor: String,
        /// Id of the failing item.
        id: EntityId,
        /// What went wrong.
        message: String,
    },

    /// A sync cycle is already running.
    #[error("a sync cycle is already running")]
    Busy,

    /// The client or engine has been shut down.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a per-item failure.
    pub fn item(type_descriptor: impl Into<String>, id: EntityId, message: impl Into<String>) -> Self {
        Self::SyncItem {
            type_descriptor: type_descriptor.into(),
            id,
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => !matches!(e, TransportError::DuplicateRequest(_)),
            SyncError::Timeout { .. } | SyncError::NotConnected | SyncError::Remote(_) => true,
            _ => false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout { after, .. } => SyncError::Timeout { after },
            TransportError::NotConnected => SyncError::NotConnected,
            other => SyncError::Transport(other),
        }
    }
}
