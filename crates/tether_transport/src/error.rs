//! Error types for the transport layer.

use std::io;
use std::time::Duration;
use tether_codec::CodecError;
use tether_model::EntityId;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur on a connection.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A frame was malformed or its bytes stopped arriving.
    #[error("framing error: {message}")]
    Framing {
        /// Error message.
        message: String,
    },

    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// How long we waited.
        after: Duration,
    },

    /// The peer went away.
    #[error("connection lost")]
    ConnectionLost,

    /// The payload did not decode as a package.
    #[error("serialization error: {0}")]
    Serialization(#[from] CodecError),

    /// A request with this id is already in flight.
    #[error("request {0} is already pending")]
    DuplicateRequest(EntityId),

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// The stream was closed locally.
    #[error("stream closed")]
    Closed,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Creates a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Returns true if the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Framing { .. }
                | TransportError::ConnectionLost
                | TransportError::Serialization(_)
                | TransportError::Closed
                | TransportError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TransportError::Timeout {
            operation: "fetch",
            after: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "fetch timed out after 60s");
        assert_eq!(TransportError::ConnectionLost.to_string(), "connection lost");
    }

    #[test]
    fn fatal_classification() {
        assert!(TransportError::framing("bad header").is_fatal());
        assert!(TransportError::ConnectionLost.is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
        assert!(!TransportError::DuplicateRequest(EntityId::nil()).is_fatal());
    }
}
