//! # Tether Storage
//!
//! Store abstraction for tether entities.
//!
//! This crate provides:
//! - `EntityStore` and `ImageStore` traits (the local persistence seam)
//! - `Query`, a small predicate language that also travels on the wire
//! - `InMemoryStore` for tests, servers and ephemeral clients
//!
//! Storage is synchronous; async callers run it on their own tasks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod query;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStore;
pub use query::{Condition, Field, Literal, Op, Query};
pub use store::{EntityStore, ImageStore};
