//! # Tether Sync Server
//!
//! TCP sync server for tether.
//!
//! This crate provides:
//! - An accept loop with one handler task per connection
//! - Routing of fetch, authenticate and streamed command packages
//! - `StoreResolver`, which answers requests from an `EntityStore`
//! - Credential authentication with HMAC-SHA256 session tokens
//! - Optional relay of streamed commands to other connected clients
//!
//! # Architecture
//!
//! The server holds no data of its own. Every request is handed to a
//! [`RequestResolver`]; the bundled [`StoreResolver`] maps fetches onto
//! store queries and applies streamed inserts, updates and soft deletes.
//!
//! # Authentication
//!
//! ```rust,ignore
//! use tether_sync_server::{AuthConfig, CredentialAuthenticator, StoreResolver};
//!
//! let auth = CredentialAuthenticator::new(AuthConfig::new(secret))
//!     .with_user("ada", "lovelace");
//! let resolver = StoreResolver::new(store).with_authenticator(Arc::new(auth));
//! ```
//!
//! A rejected login is answered with `success == false` and a message; it
//! never closes the connection.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{AuthConfig, Authenticator, CredentialAuthenticator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{RequestResolver, StoreResolver};
pub use server::{ConnectionId, ServerEvent, SyncServer};
