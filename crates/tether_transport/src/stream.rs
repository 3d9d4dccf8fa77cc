//! Framed, guarded connection.

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::frame::{encode_frame, read_frame, write_frame};
use crate::guard::{probe_socket, ConnectionGuard, Liveness};
use crate::queue::{OutboundQueue, PackageSink, StreamEvent};
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::socket::{split, SocketReader, SocketWriter};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_sync_protocol::WirePackage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

struct StreamShared {
    peer_addr: SocketAddr,
    config: TransportConfig,
    client_id: RwLock<Option<String>>,
    socket: Mutex<Option<Arc<TcpStream>>>,
    reader: tokio::sync::Mutex<Option<SocketReader>>,
    writer: tokio::sync::Mutex<Option<SocketWriter>>,
    connected: AtomicBool,
    lost: AtomicBool,
    closed: AtomicBool,
    locked: watch::Sender<bool>,
    events: mpsc::UnboundedSender<StreamEvent>,
    shutdown: Shutdown,
}

impl StreamShared {
    fn mark_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.lost.swap(true, Ordering::SeqCst) {
            info!(peer = %self.peer_addr, "connection lost");
            let _ = self.events.send(StreamEvent::ConnectionLost);
        }
    }

    async fn write(&self, package: &WirePackage) -> bool {
        let frame = match encode_frame(package) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(package_id = %package.id, error = %e, "cannot encode package");
                return false;
            }
        };

        let mut shutdown = self.shutdown.clone();
        let mut writer = self.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return false;
        };
        let result = tokio::select! {
            r = write_frame(half, &frame, self.config.send_buffer_size) => r.map_err(TransportError::from),
            _ = shutdown.wait() => Err(TransportError::Closed),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer_addr, error = %e, "write failed");
                if self.closed.load(Ordering::SeqCst) {
                    writer.take();
                } else {
                    self.mark_lost();
                }
                false
            }
        }
    }
}

impl PackageSink for StreamShared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> watch::Receiver<bool> {
        self.locked.subscribe()
    }

    async fn write_package(&self, package: &WirePackage) -> bool {
        self.write(package).await
    }
}

impl Liveness for StreamShared {
    async fn probe(&self) -> bool {
        let socket = self.socket.lock().clone();
        match socket {
            Some(socket) => probe_socket(&socket, self.config.guard.poll_timeout).await,
            None => false,
        }
    }

    fn connection_lost(&self) {
        self.mark_lost();
    }
}

/// A framed connection with an outbound queue and a liveness guard.
///
/// Reads happen on the caller's task through [`receive_package`]; writes go
/// either directly through [`write_package`] or through the queue.
///
/// [`receive_package`]: TransportStream::receive_package
/// [`write_package`]: TransportStream::write_package
pub struct TransportStream {
    shared: Arc<StreamShared>,
    queue: OutboundQueue,
    guard: ConnectionGuard,
    trigger: ShutdownTrigger,
}

impl TransportStream {
    /// Wraps a connected socket and starts its outbound queue.
    ///
    /// Stream notifications are delivered on `events`.
    pub fn open(
        socket: TcpStream,
        config: TransportConfig,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> TransportResult<Self> {
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        let socket = Arc::new(socket);
        let (reader, writer) = split(&socket);
        let (trigger, shutdown) = shutdown_channel();

        let shared = Arc::new(StreamShared {
            peer_addr,
            config: config.clone(),
            client_id: RwLock::new(None),
            socket: Mutex::new(Some(socket)),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            locked: watch::channel(false).0,
            events: events.clone(),
            shutdown: shutdown.clone(),
        });
        let (queue, _) = OutboundQueue::spawn(Arc::clone(&shared), events, shutdown);

        debug!(peer = %peer_addr, "stream opened");
        Ok(Self {
            shared,
            queue,
            guard: ConnectionGuard::new(config.guard),
            trigger,
        })
    }

    /// Starts the liveness guard. Returns false if it was already running.
    pub fn arm_guard(&self) -> bool {
        self.guard
            .arm(Arc::clone(&self.shared), self.trigger.subscribe())
    }

    /// Stops the liveness guard.
    pub fn disarm_guard(&self) {
        self.guard.disarm();
    }

    /// Returns true while the guard is probing.
    pub fn is_guarded(&self) -> bool {
        self.guard.is_armed()
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Client id associated with this connection.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.read().clone()
    }

    /// Associates a client id with this connection.
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.shared.client_id.write() = Some(client_id.into());
    }

    /// Returns true until the connection is found dead or closed.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Returns true if queued writes are held back.
    pub fn is_locked(&self) -> bool {
        *self.shared.locked.borrow()
    }

    /// Holds back (or releases) queued writes.
    pub fn set_locked(&self, locked: bool) {
        self.shared.locked.send_replace(locked);
    }

    /// Writes a package directly, bypassing the queue.
    ///
    /// Returns false if the write failed; the stream then counts as lost.
    pub async fn write_package(&self, package: &WirePackage) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared.write(package).await
    }

    /// Appends a package to the outbound queue.
    pub fn add_to_queue(&self, package: WirePackage) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.queue.push(package)
    }

    /// Packages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Probes the connection now.
    ///
    /// A failed probe marks the stream as lost.
    pub async fn check_connection(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let alive = self.shared.probe().await;
        if !alive {
            self.shared.mark_lost();
        }
        alive
    }

    /// Reads the next package.
    pub async fn receive_package(&self) -> TransportResult<WirePackage> {
        let mut shutdown = self.shared.shutdown.clone();
        let mut reader = self.shared.reader.lock().await;
        let Some(half) = reader.as_mut() else {
            return Err(TransportError::Closed);
        };
        let result = tokio::select! {
            r = read_frame(half, &self.shared.config) => r,
            _ = shutdown.wait() => Err(TransportError::Closed),
        };
        if result.is_err() && self.shared.closed.load(Ordering::SeqCst) {
            reader.take();
        }
        result
    }

    /// Closes the stream. Idempotent.
    ///
    /// Stops the queue and the guard and releases the socket; in-flight
    /// reads and writes return [`TransportError::Closed`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.guard.disarm();
        self.trigger.trigger();
        self.shared.socket.lock().take();
        if let Ok(mut reader) = self.shared.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
        debug!(peer = %self.shared.peer_addr, "stream closed");
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TransportStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("peer_addr", &self.shared.peer_addr)
            .field("client_id", &self.client_id())
            .field("connected", &self.is_connected())
            .field("queued", &self.queued())
            .finish()
    }
}
