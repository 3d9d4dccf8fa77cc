//! Client engine.
//!
//! Owns at most one [`TransportStream`] at a time. Fetches and
//! authentication go through the correlation table and wait for their
//! answer; commands are queued and never waited on.

use crate::config::ClientConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_model::{Entity, EntityId, ImageAttachment};
use tether_storage::Query;
use tether_sync_protocol::{
    AuthenticationPayload, FetchSpec, PackageKind, PackageMethod, WirePackage,
};
use tether_transport::{
    CorrelationTable, ShutdownTrigger, StreamEvent, TransportError, TransportStream,
    shutdown_channel,
};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Connection lifecycle of a [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt running.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected to the server.
    Connected,
    /// Connection lost; retrying in the background.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

impl ConnectionState {
    /// Returns true if the client may be used for requests.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Notifications published by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection was established.
    Connected,
    /// The connection was lost or closed.
    Disconnected,
    /// The server pushed a package nobody asked for.
    Streaming(WirePackage),
    /// A queued package reached the socket.
    PackageSent(WirePackage),
    /// A queued package could not be written.
    Error(String),
}

struct ClientShared {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    stream: RwLock<Option<Arc<TransportStream>>>,
    correlation: CorrelationTable,
    fetch_gate: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
    pending: Mutex<VecDeque<WirePackage>>,
    events: broadcast::Sender<ClientEvent>,
    trigger: ShutdownTrigger,
    reconnecting: AtomicBool,
}

/// Connection to a sync server.
///
/// Only one fetch is on the wire at a time: a second caller waits until the
/// first one has its answer. Commands sent while disconnected are buffered
/// and flushed on the next successful connect.
///
/// # Example
///
/// ```no_run
/// use tether_sync_engine::{ClientConfig, SyncClient};
/// use tether_sync_protocol::FetchSpec;
///
/// # async fn run() -> tether_sync_engine::SyncResult<()> {
/// let client = SyncClient::new(ClientConfig::new("127.0.0.1:8080".parse().unwrap(), "device-1"));
/// client.connect().await?;
/// let people = client.fetch(FetchSpec::new("Person").with_page(20, 0)).await?;
/// println!("{} people", people.result_entities.len());
/// # Ok(())
/// # }
/// ```
pub struct SyncClient {
    shared: Arc<ClientShared>,
}

impl SyncClient {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (trigger, _) = shutdown_channel();
        Self {
            shared: Arc::new(ClientShared {
                correlation: CorrelationTable::new(config.request_timeout),
                config,
                state: watch::channel(ConnectionState::Disconnected).0,
                stream: RwLock::new(None),
                fetch_gate: tokio::sync::Mutex::new(()),
                connect_lock: tokio::sync::Mutex::new(()),
                pending: Mutex::new(VecDeque::new()),
                events,
                trigger,
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Client id stamped on outgoing packages.
    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    /// Connects to the server.
    ///
    /// Returns immediately if already connected. A failed first attempt is
    /// not retried; reconnecting only starts after an established
    /// connection is lost.
    pub async fn connect(&self) -> SyncResult<()> {
        self.shared.connect().await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch over the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Returns true while a live stream is attached.
    pub fn is_connected(&self) -> bool {
        self.shared
            .current_stream()
            .is_some_and(|stream| stream.is_connected())
    }

    /// Probes the connection now. A failed probe starts the reconnect path.
    pub async fn check_connection(&self) -> bool {
        match self.shared.current_stream() {
            Some(stream) => stream.check_connection().await,
            None => false,
        }
    }

    /// Connects unless already connected.
    pub async fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    /// Sends a request and waits for its correlated answer.
    pub async fn fetch_package(&self, package: WirePackage) -> SyncResult<WirePackage> {
        let timeout = self.shared.correlation.timeout();
        self.fetch_package_within(package, timeout).await
    }

    /// Like [`fetch_package`](Self::fetch_package) with an explicit timeout.
    pub async fn fetch_package_within(
        &self,
        package: WirePackage,
        timeout: Duration,
    ) -> SyncResult<WirePackage> {
        let _turn = self.shared.fetch_gate.lock().await;
        let stream = self
            .shared
            .current_stream()
            .filter(|stream| stream.is_connected())
            .ok_or(SyncError::NotConnected)?;

        let package = package.with_client_id(self.client_id());
        let id = package.id;
        let pending = self.shared.correlation.begin(id)?;
        trace!(package_id = %id, kind = ?package.kind, "request sent");

        if !stream.write_package(&package).await {
            self.shared.correlation.cancel(&id);
            return Err(TransportError::ConnectionLost.into());
        }

        match self.shared.correlation.wait_within(pending, timeout).await {
            Ok(response) => Ok(response),
            Err(TransportError::Timeout { .. }) => {
                debug!(package_id = %id, ?timeout, "request timed out");
                Err(SyncError::Timeout { after: timeout })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Runs a fetch and returns the filled spec.
    ///
    /// A server-side failure in `result_error` is returned as
    /// [`SyncError::Remote`].
    pub async fn fetch(&self, spec: FetchSpec) -> SyncResult<FetchSpec> {
        let response = self.fetch_package(WirePackage::fetch(spec)).await?;
        let mut spec = response
            .fetch
            .ok_or_else(|| SyncError::Protocol("fetch answer carries no result".into()))?;
        match spec.result_error.take() {
            Some(message) => Err(SyncError::Remote(message)),
            None => Ok(spec),
        }
    }

    /// Fetches a page of entities.
    pub async fn fetch_entities(
        &self,
        type_descriptor: &str,
        query: Option<&Query>,
        take: u32,
        skip: u32,
        include_all: bool,
    ) -> SyncResult<Vec<Entity>> {
        let mut spec = FetchSpec::new(type_descriptor)
            .with_page(take, skip)
            .with_include_all(include_all);
        if let Some(query) = query {
            spec = spec.with_query(query.to_string());
        }
        Ok(self.fetch(spec).await?.result_entities)
    }

    /// Fetches at most `max` ids; 0 means all.
    pub async fn fetch_ids(
        &self,
        type_descriptor: &str,
        query: Option<&Query>,
        max: u32,
    ) -> SyncResult<Vec<EntityId>> {
        let mut spec = FetchSpec::new(type_descriptor).with_page(max, 0).ids_only();
        if let Some(query) = query {
            spec = spec.with_query(query.to_string());
        }
        Ok(self.fetch(spec).await?.result_ids)
    }

    /// Fetches the attachments of `owner`.
    pub async fn fetch_images(&self, owner: &Entity) -> SyncResult<Vec<ImageAttachment>> {
        let response = self
            .fetch_package(WirePackage::fetch_images(owner.detached()))
            .await?;
        let mut spec = response
            .fetch
            .ok_or_else(|| SyncError::Protocol("image answer carries no result".into()))?;
        match spec.result_error.take() {
            Some(message) => Err(SyncError::Remote(message)),
            None => Ok(spec.result_images),
        }
    }

    /// Checks credentials with the server.
    ///
    /// A rejected login is an `Ok` payload with `success == false`.
    pub async fn authenticate(
        &self,
        credentials: AuthenticationPayload,
    ) -> SyncResult<AuthenticationPayload> {
        let response = self
            .fetch_package(WirePackage::authenticate(credentials))
            .await?;
        response
            .authentication
            .ok_or_else(|| SyncError::Protocol("authentication answer carries no payload".into()))
    }

    /// Queues a package without waiting for an answer.
    ///
    /// While disconnected the package is buffered until the next connect.
    pub fn send(&self, package: WirePackage) -> SyncResult<()> {
        if self.shared.trigger.is_triggered() {
            return Err(SyncError::Cancelled);
        }
        self.shared
            .enqueue(package.with_client_id(self.client_id()));
        Ok(())
    }

    /// Sends an insert command.
    pub fn insert(&self, entity: Entity) -> SyncResult<()> {
        self.send(WirePackage::command(PackageMethod::Insert, entity))
    }

    /// Sends an update command.
    pub fn update(&self, entity: Entity) -> SyncResult<()> {
        self.send(WirePackage::command(PackageMethod::Update, entity))
    }

    /// Sends a delete command.
    pub fn delete(&self, entity: Entity) -> SyncResult<()> {
        self.send(WirePackage::command(PackageMethod::Delete, entity))
    }

    /// Sends an attachment.
    pub fn save_image(&self, image: ImageAttachment) -> SyncResult<()> {
        self.send(WirePackage::image_command(PackageMethod::Update, image))
    }

    /// Sends an attachment removal.
    pub fn delete_image(&self, image: ImageAttachment) -> SyncResult<()> {
        self.send(WirePackage::image_command(PackageMethod::Delete, image))
    }

    /// Packages buffered while disconnected.
    pub fn pending_sends(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Drops the connection without reconnecting.
    pub fn disconnect(&self) {
        let stream = self.shared.stream.write().take();
        if let Some(stream) = stream {
            stream.close();
            self.shared.correlation.fail_all();
            info!(client_id = %self.client_id(), "disconnected");
            self.shared.emit(ClientEvent::Disconnected);
        }
        if !self.shared.trigger.is_triggered() {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Closes the connection and stops reconnecting. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.trigger.is_triggered() {
            return;
        }
        self.shared.trigger.trigger();
        self.disconnect();
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("remote_addr", &self.shared.config.remote_addr)
            .field("client_id", &self.shared.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientShared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_stream(&self) -> Option<Arc<TransportStream>> {
        self.stream.read().clone()
    }

    async fn connect(self: &Arc<Self>) -> SyncResult<()> {
        let _attempt = self.connect_lock.lock().await;
        if self.trigger.is_triggered() {
            return Err(SyncError::Cancelled);
        }
        if self
            .current_stream()
            .is_some_and(|stream| stream.is_connected())
        {
            return Ok(());
        }

        let retrying = self.reconnecting.load(Ordering::SeqCst);
        if !retrying {
            self.set_state(ConnectionState::Connecting);
        }

        let addr = self.config.remote_addr;
        let socket = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(self.connect_failed(TransportError::from(e).into())),
            Err(_) => {
                return Err(self.connect_failed(SyncError::Timeout {
                    after: self.config.connect_timeout,
                }))
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = match TransportStream::open(socket, self.config.transport.clone(), events_tx) {
            Ok(stream) => Arc::new(stream),
            Err(e) => return Err(self.connect_failed(e.into())),
        };
        stream.set_client_id(self.config.client_id.as_str());
        stream.arm_guard();

        let flushed = {
            let mut pending = self.pending.lock();
            *self.stream.write() = Some(Arc::clone(&stream));
            let mut flushed = 0;
            while let Some(package) = pending.pop_front() {
                if let Err(e) = stream.add_to_queue(package) {
                    debug!(error = %e, "buffered package not flushed");
                    break;
                }
                flushed += 1;
            }
            flushed
        };

        tokio::spawn(watch_stream(Arc::clone(self), Arc::downgrade(&stream), events_rx));
        tokio::spawn(read_loop(Arc::clone(self), stream));

        self.set_state(ConnectionState::Connected);
        info!(%addr, client_id = %self.config.client_id, flushed, "connected to server");
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    fn connect_failed(&self, error: SyncError) -> SyncError {
        debug!(addr = %self.config.remote_addr, error = %error, "connect failed");
        if !self.reconnecting.load(Ordering::SeqCst) && !self.trigger.is_triggered() {
            self.set_state(ConnectionState::Disconnected);
        }
        error
    }

    fn enqueue(&self, package: WirePackage) {
        let mut pending = self.pending.lock();
        let stream = self
            .current_stream()
            .filter(|stream| stream.is_connected() && !stream.is_closed());
        if let Some(stream) = stream {
            let id = package.id;
            if let Err(e) = stream.add_to_queue(package) {
                warn!(package_id = %id, error = %e, "package not queued");
            }
            return;
        }

        if pending.len() >= self.config.max_pending_sends {
            if let Some(dropped) = pending.pop_front() {
                warn!(package_id = %dropped.id, "pending buffer full, dropping oldest package");
            }
        }
        trace!(package_id = %package.id, "buffered while disconnected");
        pending.push_back(package);
    }

    fn dispatch(&self, package: WirePackage) {
        if package.kind == PackageKind::FetchResult || self.correlation.is_pending(&package.id) {
            let id = package.id;
            if !self.correlation.complete(package) {
                debug!(package_id = %id, "answer without a waiting request");
            }
            return;
        }
        trace!(package_id = %package.id, "streaming package received");
        self.emit(ClientEvent::Streaming(package));
    }

    fn connection_lost(self: &Arc<Self>, stream: &Arc<TransportStream>) {
        let was_current = {
            let mut slot = self.stream.write();
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, stream) => {
                    slot.take();
                    true
                }
                _ => false,
            }
        };
        stream.close();
        if !was_current {
            return;
        }

        self.correlation.fail_all();
        info!(addr = %self.config.remote_addr, "connection to server lost");
        self.emit(ClientEvent::Disconnected);

        if self.trigger.is_triggered() {
            self.set_state(ConnectionState::Closed);
        } else if self.config.reconnect {
            if !self.reconnecting.swap(true, Ordering::SeqCst) {
                self.set_state(ConnectionState::Reconnecting);
                tokio::spawn(reconnect_loop(Arc::clone(self)));
            }
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

async fn read_loop(shared: Arc<ClientShared>, stream: Arc<TransportStream>) {
    loop {
        match stream.receive_package().await {
            Ok(package) => shared.dispatch(package),
            Err(e) => {
                debug!(error = %e, "read loop exiting");
                break;
            }
        }
    }
    shared.connection_lost(&stream);
}

async fn watch_stream(
    shared: Arc<ClientShared>,
    stream: Weak<TransportStream>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::PackageSent(package) => shared.emit(ClientEvent::PackageSent(package)),
            StreamEvent::ConnectionLost => {
                if let Some(stream) = stream.upgrade() {
                    shared.connection_lost(&stream);
                }
            }
            StreamEvent::Error(message) => {
                warn!(%message, "outbound queue error");
                shared.emit(ClientEvent::Error(message));
            }
        }
    }
}

async fn reconnect_loop(shared: Arc<ClientShared>) {
    let mut shutdown = shared.trigger.subscribe();
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        debug!(attempt, "trying to reconnect");
        match shared.connect().await {
            Ok(()) => break,
            Err(SyncError::Cancelled) => break,
            Err(e) => debug!(attempt, error = %e, "reconnect failed"),
        }
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
    }
    shared.reconnecting.store(false, Ordering::SeqCst);
    if shared.trigger.is_triggered() {
        shared.set_state(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_addr() -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn unreachable_client() -> SyncClient {
        let config = ClientConfig::new(closed_addr(), "device-1")
            .with_connect_timeout(Duration::from_millis(500));
        SyncClient::new(config)
    }

    #[test]
    fn connection_state_checks() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(!ConnectionState::Closed.is_connected());
    }

    #[tokio::test]
    async fn sends_are_buffered_while_disconnected() {
        let client = unreachable_client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.insert(Entity::new("Person")).unwrap();
        client.update(Entity::new("Person")).unwrap();
        assert_eq!(client.pending_sends(), 2);
    }

    #[tokio::test]
    async fn pending_buffer_is_bounded() {
        let config = ClientConfig::new(closed_addr(), "device-1").with_max_pending_sends(2);
        let client = SyncClient::new(config);
        for _ in 0..5 {
            client.insert(Entity::new("Person")).unwrap();
        }
        assert_eq!(client.pending_sends(), 2);
    }

    #[tokio::test]
    async fn fetch_without_connection_fails() {
        let client = unreachable_client();
        let err = client.fetch(FetchSpec::new("Person")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
    }

    #[tokio::test]
    async fn failed_connect_leaves_client_disconnected() {
        let client = unreachable_client();
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.check_connection().await);
    }

    #[tokio::test]
    async fn shutdown_is_final() {
        let client = unreachable_client();
        client.shutdown();
        client.shutdown();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.connect().await, Err(SyncError::Cancelled)));
        assert!(matches!(
            client.insert(Entity::new("Person")),
            Err(SyncError::Cancelled)
        ));
    }
}
