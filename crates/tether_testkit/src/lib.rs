//! # Tether Testkit
//!
//! Test utilities for tether.
//!
//! This crate provides:
//! - Typed fixtures (`Person`, `Address`) and a registry that knows them
//! - Transport settings tuned for fast loopback tests
//! - Property-based test generators using proptest
//! - `TestServer`, a sync server over an in-memory store on a free port
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn fetches_from_a_live_server() {
//!     let server = TestServer::start().await;
//!     server.seed(person("Ada", 36));
//!     // ... connect a client to server.addr()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
