//! # Tether Sync Engine
//!
//! Client side of tether: the connection engine, the reconciliation loop
//! and the local data service.
//!
//! This crate provides:
//! - `SyncClient`: connect/reconnect state machine, correlated fetch and
//!   authentication, fire-and-forget commands with a pending buffer
//! - `SyncEngine`: periodic pull/push/prune cycles with last-write-wins
//! - `EntityCache`: an injected in-memory cache
//! - `DataService`: local reads and writes mirrored to the server
//!
//! ## Reconciliation
//!
//! For every observed type a cycle:
//! 1. pulls remote entities modified since the last checkpoint (minus an
//!    overlap), page by page, until a page is empty or the retention cap
//!    is reached;
//! 2. applies each one: absent locally means insert, remote newer means
//!    update (or delete when archived), otherwise the local copy stays;
//! 3. pushes every local entity not yet synced;
//! 4. deletes the oldest local entities beyond the retention cap.
//!
//! ## Key Invariants
//!
//! - Cycles never overlap; a tick during a cycle is dropped
//! - The checkpoint only advances after a cycle with no failed item
//! - At most one fetch per client is on the wire at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod error;
mod remote;
mod service;
mod state;

pub use cache::EntityCache;
pub use client::{ClientEvent, ConnectionState, SyncClient};
pub use config::{ClientConfig, ObservingType, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use remote::{MockRemote, RemoteAuthority};
pub use service::DataService;
pub use state::{
    reconcile, ReconcileAction, SyncCycleResult, SyncEngine, SyncState, SyncStats, CHECKPOINT_TYPE,
};
