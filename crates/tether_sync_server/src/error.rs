//! Error types for the sync server.

use tether_storage::StorageError;
use tether_transport::TransportError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server is already running.
    #[error("server already started")]
    AlreadyStarted,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the client sent something unusable.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::Storage(StorageError::InvalidQuery { .. })
        )
    }

    /// Returns true if the failure is on the server side.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        let query = ServerError::from(StorageError::InvalidQuery {
            position: 3,
            message: "expected operator".into(),
        });
        assert!(query.is_client_error());
        assert!(ServerError::from(StorageError::Backend("disk".into())).is_server_error());
    }

    #[test]
    fn error_display() {
        let msg = ServerError::AuthenticationFailed("unknown user".into()).to_string();
        assert!(msg.contains("unknown user"));
    }
}
