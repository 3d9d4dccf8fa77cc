//! Credential checks and session tokens.
//!
//! Passwords are kept as SHA-256 digests. A successful login is answered
//! with an HMAC-SHA256 session token bound to the user name.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over user name and issue time
//!
//! Total: 40 bytes, hex-encoded for transport.

use crate::error::{ServerError, ServerResult};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;
use tether_sync_protocol::AuthenticationPayload;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 40;

/// Checks credentials carried by an `Authenticate` package.
///
/// Implementations answer with a payload; a rejected login is a payload
/// with `success == false`, never an error.
pub trait Authenticator: Send + Sync {
    /// Checks `request` and builds the answer.
    fn authenticate(&self, request: &AuthenticationPayload) -> AuthenticationPayload;
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// User table with password digests.
pub struct CredentialAuthenticator {
    config: AuthConfig,
    users: RwLock<HashMap<String, [u8; 32]>>,
}

impl CredentialAuthenticator {
    /// Creates an authenticator with no users.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a user.
    pub fn with_user(self, user_name: impl Into<String>, password: &str) -> Self {
        self.add_user(user_name, password);
        self
    }

    /// Adds or replaces a user.
    pub fn add_user(&self, user_name: impl Into<String>, password: &str) {
        self.users.write().insert(user_name.into(), digest(password));
    }

    /// Removes a user. Returns true if it existed.
    pub fn remove_user(&self, user_name: &str) -> bool {
        self.users.write().remove(user_name).is_some()
    }

    /// Number of known users.
    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Checks a password.
    pub fn verify(&self, user_name: &str, password: &str) -> ServerResult<()> {
        let users = self.users.read();
        let stored = users
            .get(user_name)
            .ok_or_else(|| ServerError::AuthenticationFailed("unknown user".into()))?;
        if *stored != digest(password) {
            return Err(ServerError::AuthenticationFailed("wrong password".into()));
        }
        Ok(())
    }

    /// Issues a session token for `user_name`.
    pub fn create_token(&self, user_name: &str) -> ServerResult<String> {
        let issued = Utc::now().timestamp_millis().max(0) as u64;
        let signature = self.sign(user_name, issued)?;

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&issued.to_be_bytes());
        token.extend_from_slice(&signature);
        Ok(to_hex(&token))
    }

    /// Validates a session token issued for `user_name`.
    pub fn validate_token(&self, token: &str, user_name: &str) -> ServerResult<()> {
        let bytes = from_hex(token)
            .filter(|b| b.len() == TOKEN_LEN)
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;

        let mut issued_bytes = [0u8; 8];
        issued_bytes.copy_from_slice(&bytes[..8]);
        let issued = u64::from_be_bytes(issued_bytes);

        let mut mac = self.mac()?;
        mac.update(user_name.as_bytes());
        mac.update(&issued_bytes);
        mac.verify_slice(&bytes[8..])
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let now = Utc::now().timestamp_millis().max(0) as u64;
        let expiry = self.config.token_expiry.as_millis() as u64;
        if now > issued.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }
        Ok(())
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))
    }

    fn sign(&self, user_name: &str, issued: u64) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(user_name.as_bytes());
        mac.update(&issued.to_be_bytes());
        Ok(mac.finalize().into_bytes().into())
    }
}

impl Authenticator for CredentialAuthenticator {
    fn authenticate(&self, request: &AuthenticationPayload) -> AuthenticationPayload {
        let user = request.user_name.as_str();
        let outcome = self
            .verify(user, &request.password)
            .and_then(|()| self.create_token(user));

        let mut response = match outcome {
            Ok(token) => {
                info!(user, "user authenticated");
                AuthenticationPayload::accepted(user, Some(token))
            }
            Err(e) => {
                debug!(user, error = %e, "authentication rejected");
                AuthenticationPayload::failure(user, e.to_string())
            }
        };
        response.target_type = request.target_type.clone();
        response
    }
}

impl std::fmt::Debug for CredentialAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialAuthenticator")
            .field("users", &self.user_count())
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

fn digest(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn authenticator() -> CredentialAuthenticator {
        CredentialAuthenticator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
            .with_user("ada", "lovelace")
    }

    #[test]
    fn accepts_known_user() {
        let auth = authenticator();
        let response = auth.authenticate(
            &AuthenticationPayload::credentials("ada", "lovelace").with_target_type("Person"),
        );

        assert!(response.success);
        assert!(response.password.is_empty());
        assert_eq!(response.target_type.as_deref(), Some("Person"));
        let token = response.session_token.unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        auth.validate_token(&token, "ada").unwrap();
    }

    #[test]
    fn rejects_wrong_password_without_error() {
        let response =
            authenticator().authenticate(&AuthenticationPayload::credentials("ada", "babbage"));
        assert!(!response.success);
        assert!(response.session_token.is_none());
        assert!(response.error_message.unwrap().contains("wrong password"));
    }

    #[test]
    fn rejects_unknown_user() {
        let response =
            authenticator().authenticate(&AuthenticationPayload::credentials("eve", "x"));
        assert!(!response.success);
        assert!(response.error_message.unwrap().contains("unknown user"));
    }

    #[test]
    fn token_bound_to_user() {
        let auth = authenticator();
        let token = auth.create_token("ada").unwrap();
        assert!(auth.validate_token(&token, "eve").is_err());
    }

    #[test]
    fn reject_tampered_token() {
        let auth = authenticator();
        let mut token = auth.create_token("ada").unwrap().into_bytes();
        let last = token.len() - 1;
        token[last] = if token[last] == b'0' { b'1' } else { b'0' };
        let token = String::from_utf8(token).unwrap();
        assert!(auth.validate_token(&token, "ada").is_err());
        assert!(auth.validate_token("not-hex", "ada").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let auth = CredentialAuthenticator::new(
            AuthConfig::new(b"secret".to_vec()).with_expiry(Duration::from_secs(0)),
        )
        .with_user("ada", "lovelace");
        let token = auth.create_token("ada").unwrap();

        std::thread::sleep(Duration::from_millis(10));

        assert!(auth.validate_token(&token, "ada").is_err());
    }

    #[test]
    fn user_management() {
        let auth = authenticator();
        auth.add_user("grace", "hopper");
        assert_eq!(auth.user_count(), 2);
        assert!(auth.verify("grace", "hopper").is_ok());
        assert!(auth.remove_user("grace"));
        assert!(auth.verify("grace", "hopper").is_err());
    }

    proptest! {
        #[test]
        fn hex_encoding_is_reversible(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(from_hex(&to_hex(&bytes)), Some(bytes));
        }

        #[test]
        fn only_the_registered_password_is_accepted(password in ".{0,24}") {
            let accepted = authenticator()
                .authenticate(&AuthenticationPayload::credentials("ada", password.as_str()))
                .success;
            prop_assert_eq!(accepted, password == "lovelace");
        }

        #[test]
        fn tokens_only_validate_for_their_user(user in "[a-z]{1,12}", other in "[a-z]{1,12}") {
            let auth = authenticator();
            let token = auth.create_token(&user).unwrap();
            prop_assert!(auth.validate_token(&token, &user).is_ok());
            prop_assert_eq!(auth.validate_token(&token, &other).is_ok(), user == other);
        }
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(from_hex("00abff"), Some(vec![0x00, 0xab, 0xff]));
        assert_eq!(from_hex("abc"), None);
    }
}
