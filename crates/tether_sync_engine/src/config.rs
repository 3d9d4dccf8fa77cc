//! Configuration for the client and the sync engine.

use std::net::SocketAddr;
use std::time::Duration;
use tether_transport::{TransportConfig, DEFAULT_RESPONSE_TIMEOUT};

/// Configuration for a [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub remote_addr: SocketAddr,
    /// Client id stamped on every outgoing package.
    pub client_id: String,
    /// Upper bound for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Reconnect after a lost connection.
    pub reconnect: bool,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// How long a fetch waits for its answer.
    pub request_timeout: Duration,
    /// Packages buffered while disconnected before the oldest is dropped.
    pub max_pending_sends: usize,
    /// Capacity of the client event channel.
    pub event_capacity: usize,
    /// Transport settings.
    pub transport: TransportConfig,
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new(remote_addr: SocketAddr, client_id: impl Into<String>) -> Self {
        Self {
            remote_addr,
            client_id: client_id.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            request_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_pending_sends: 10_000,
            event_capacity: 256,
            transport: TransportConfig::default(),
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables reconnecting.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the delay between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the pending send buffer size.
    pub fn with_max_pending_sends(mut self, max: usize) -> Self {
        self.max_pending_sends = max;
        self
    }

    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

/// Sync policy for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservingType {
    /// Type descriptor.
    pub type_descriptor: String,
    /// Page size for pulls.
    pub max_items_per_request: u32,
    /// Local retention cap; also bounds how far a pull pages.
    pub max_items_retained: usize,
    /// Never pull, only push and prune.
    pub push_only: bool,
    /// Pull full relation graphs.
    pub include_relations: bool,
}

impl ObservingType {
    /// Observes `type_descriptor` with default limits.
    pub fn new(type_descriptor: impl Into<String>) -> Self {
        Self {
            type_descriptor: type_descriptor.into(),
            max_items_per_request: 100,
            max_items_retained: 1000,
            push_only: false,
            include_relations: false,
        }
    }

    /// Sets the pull page size.
    pub fn with_page_size(mut self, size: u32) -> Self {
        self.max_items_per_request = size;
        self
    }

    /// Sets the retention cap.
    pub fn with_retention(mut self, max: usize) -> Self {
        self.max_items_retained = max;
        self
    }

    /// Marks the type as push-only.
    pub fn push_only(mut self) -> Self {
        self.push_only = true;
        self
    }

    /// Pulls relation graphs.
    pub fn with_relations(mut self) -> Self {
        self.include_relations = true;
        self
    }
}

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Delay before the first cycle.
    pub first_cycle_delay: Duration,
    /// Pulls start this long before the last checkpoint.
    pub checkpoint_overlap: Duration,
    /// Pull window when no checkpoint exists yet.
    pub initial_lookback: Duration,
    /// Synchronized types.
    pub observed: Vec<ObservingType>,
}

impl SyncConfig {
    /// Creates a configuration with no observed types.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            first_cycle_delay: Duration::from_secs(2),
            checkpoint_overlap: Duration::from_secs(10 * 60),
            initial_lookback: Duration::from_secs(365 * 24 * 60 * 60),
            observed: Vec::new(),
        }
    }

    /// Adds an observed type.
    pub fn observe(mut self, observed: ObservingType) -> Self {
        self.observed.push(observed);
        self
    }

    /// Sets the delay before the first cycle.
    pub fn with_first_cycle_delay(mut self, delay: Duration) -> Self {
        self.first_cycle_delay = delay;
        self
    }

    /// Sets the checkpoint overlap.
    pub fn with_checkpoint_overlap(mut self, overlap: Duration) -> Self {
        self.checkpoint_overlap = overlap;
        self
    }

    /// Sets the initial lookback.
    pub fn with_initial_lookback(mut self, lookback: Duration) -> Self {
        self.initial_lookback = lookback;
        self
    }

    /// Policy for `type_descriptor`, if observed.
    pub fn observing(&self, type_descriptor: &str) -> Option<&ObservingType> {
        self.observed
            .iter()
            .find(|o| o.type_descriptor == type_descriptor)
    }

    /// Returns true if `type_descriptor` is observed.
    pub fn is_observed(&self, type_descriptor: &str) -> bool {
        self.observing(type_descriptor).is_some()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
