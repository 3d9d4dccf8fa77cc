//! Authentication payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Credentials on the way in, outcome on the way back.
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AuthenticationPayload {
    /// User name.
    pub user_name: String,
    /// Password. Cleared by the server before answering.
    #[serde(default)]
    pub password: String,
    /// Type descriptor of the user model the caller expects.
    #[serde(default)]
    pub target_type: Option<String>,
    /// Outcome.
    #[serde(default)]
    pub success: bool,
    /// Failure description.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Session token issued on success.
    #[serde(default)]
    pub session_token: Option<String>,
}

impl AuthenticationPayload {
    /// Creates a credential request.
    pub fn credentials(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Sets the expected user model type.
    pub fn with_target_type(mut self, target_type: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self
    }

    /// Builds a failed outcome for `user_name`.
    pub fn failure(user_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Builds a successful outcome.
    pub fn accepted(user_name: impl Into<String>, session_token: Option<String>) -> Self {
        Self {
            user_name: user_name.into(),
            success: true,
            session_token,
            ..Self::default()
        }
    }
}

impl fmt::Debug for AuthenticationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationPayload")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("target_type", &self.target_type)
            .field("success", &self.success)
            .field("error_message", &self.error_message)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let payload = AuthenticationPayload::credentials("ada", "hunter2");
        let debug = format!("{payload:?}");
        assert!(debug.contains("ada"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn outcomes() {
        let failed = AuthenticationPayload::failure("ada", "wrong password");
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("wrong password"));

        let ok = AuthenticationPayload::accepted("ada", Some("t".into()));
        assert!(ok.success);
        assert!(ok.password.is_empty());
    }
}
