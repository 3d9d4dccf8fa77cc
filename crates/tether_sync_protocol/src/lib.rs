//! # Tether Sync Protocol
//!
//! Wire package types for tether.
//!
//! This crate provides:
//! - `WirePackage`, the single unit exchanged over a connection
//! - `PackageKind` / `PackageMethod`
//! - `FetchSpec` for queries and their results
//! - `AuthenticationPayload`
//!
//! This is a pure protocol crate with no I/O operations. Framing lives in
//! `tether_transport`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod fetch;
mod package;

pub use auth::AuthenticationPayload;
pub use fetch::FetchSpec;
pub use package::{PackageKind, PackageMethod, WirePackage};
