//! # Tether Transport
//!
//! Framed TCP connections for tether.
//!
//! This crate provides:
//! - 32-byte length-prefixed framing with chunked writes and stall detection
//! - `TransportStream`, a connection with an outbound queue and liveness guard
//! - `ConnectionGuard`, which reports a dead peer exactly once
//! - `CorrelationTable`, which matches answers to waiting requests
//!
//! # Queue semantics
//!
//! The outbound queue is strictly FIFO with a single consumer. While the
//! stream is locked the head of the queue waits; once the stream is found
//! disconnected queued packages are dropped rather than retried. Every
//! successful write is reported as [`StreamEvent::PackageSent`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod correlation;
mod error;
mod frame;
mod guard;
mod queue;
mod shutdown;
mod socket;
mod stream;

pub use config::{GuardConfig, TransportConfig, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SEND_BUFFER_SIZE};
pub use correlation::{CorrelationTable, PendingResponse, DEFAULT_RESPONSE_TIMEOUT};
pub use error::{TransportError, TransportResult};
pub use frame::{encode_frame, frame_payload, parse_header, read_frame, write_frame, HEADER_SIZE};
pub use guard::{probe_socket, ConnectionGuard, Liveness};
pub use queue::{OutboundQueue, PackageSink, StreamEvent};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use stream::TransportStream;
