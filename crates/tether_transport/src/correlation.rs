//! Request/response correlation.
//!
//! A request registers its id before it is written; the read loop hands
//! every answer carrying a registered id back to the waiting caller.

use crate::error::{TransportError, TransportResult};
use dashmap::DashMap;
use std::time::Duration;
use tether_model::EntityId;
use tether_sync_protocol::WirePackage;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How long a request waits for its answer by default.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// A registered request waiting for its answer.
#[derive(Debug)]
pub struct PendingResponse {
    id: EntityId,
    rx: oneshot::Receiver<WirePackage>,
}

impl PendingResponse {
    /// Id of the request.
    pub fn id(&self) -> EntityId {
        self.id
    }
}

/// Pending requests keyed by package id.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: DashMap<EntityId, oneshot::Sender<WirePackage>>,
    timeout: Duration,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl CorrelationTable {
    /// Creates an empty table.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Response timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a request id.
    pub fn begin(&self, id: EntityId) -> TransportResult<PendingResponse> {
        use dashmap::mapref::entry::Entry;

        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(TransportError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                trace!(request_id = %id, "request registered");
                Ok(PendingResponse { id, rx })
            }
        }
    }

    /// Delivers `response` to the request with the same id.
    ///
    /// Returns false if nothing was waiting for it.
    pub fn complete(&self, response: WirePackage) -> bool {
        match self.pending.remove(&response.id) {
            Some((id, tx)) => {
                let delivered = tx.send(response).is_ok();
                if !delivered {
                    debug!(request_id = %id, "response arrived after caller gave up");
                }
                delivered
            }
            None => false,
        }
    }

    /// Waits for the answer to `pending` for the table's default timeout.
    pub async fn wait(&self, pending: PendingResponse) -> TransportResult<WirePackage> {
        self.wait_within(pending, self.timeout).await
    }

    /// Waits for the answer to `pending` for at most `timeout`.
    ///
    /// `timeout` replaces the table default, so it may be longer or shorter.
    pub async fn wait_within(
        &self,
        pending: PendingResponse,
        timeout: Duration,
    ) -> TransportResult<WirePackage> {
        let PendingResponse { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.pending.remove(&id);
                debug!(request_id = %id, ?timeout, "request timed out");
                Err(TransportError::Timeout {
                    operation: "response",
                    after: timeout,
                })
            }
        }
    }

    /// Returns true if `id` is waiting for an answer.
    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.pending.contains_key(id)
    }

    /// Forgets a request. Its waiter sees [`TransportError::ConnectionLost`].
    pub fn cancel(&self, id: &EntityId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Fails every pending request.
    pub fn fail_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(count, "failed pending requests");
        }
        count
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
