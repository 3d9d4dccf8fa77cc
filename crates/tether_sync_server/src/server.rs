//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestResolver;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_model::EntityId;
use tether_sync_protocol::{AuthenticationPayload, PackageKind, WirePackage};
use tether_transport::{
    shutdown_channel, Shutdown, ShutdownTrigger, StreamEvent, TransportStream,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Identifies one accepted connection for the lifetime of the server.
pub type ConnectionId = u64;

/// Notifications published by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted.
    ClientConnected {
        /// Connection id.
        connection: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
    },
    /// A connection announced its client id.
    ClientIdentified {
        /// Connection id.
        connection: ConnectionId,
        /// Announced client id.
        client_id: String,
    },
    /// A login attempt was answered.
    Authenticated {
        /// Connection id.
        connection: ConnectionId,
        /// User name from the request.
        user_name: String,
        /// Outcome.
        success: bool,
    },
    /// A streamed command was applied to the store.
    StreamApplied {
        /// Connection id.
        connection: ConnectionId,
        /// Package id.
        package_id: EntityId,
    },
    /// A connection handler exited. Fired once per connection.
    ClientDisconnected {
        /// Connection id.
        connection: ConnectionId,
        /// Client id, if one was announced.
        client_id: Option<String>,
    },
    /// A request could not be processed.
    Error {
        /// Connection id.
        connection: ConnectionId,
        /// Failure description.
        message: String,
    },
}

struct ServerShared {
    config: ServerConfig,
    resolver: Arc<dyn RequestResolver>,
    connections: DashMap<ConnectionId, Arc<TransportStream>>,
    next_connection: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    limit: Arc<Semaphore>,
}

/// The sync server.
///
/// Accepts TCP connections and runs one handler task per connection. Each
/// handler reads packages in order and routes them by kind:
/// - `Fetch` is resolved before the next package is read and answered with a
///   `FetchResult` carrying the request's id;
/// - `Authenticate` is answered from a separate task;
/// - everything else is a streamed command, applied in arrival order on the
///   connection's apply task and optionally relayed to other clients.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tether_storage::InMemoryStore;
/// use tether_sync_server::{ServerConfig, StoreResolver, SyncServer};
///
/// # async fn run() -> tether_sync_server::ServerResult<()> {
/// let resolver = StoreResolver::new(Arc::new(InMemoryStore::new()));
/// let server = SyncServer::new(ServerConfig::default(), resolver);
/// let addr = server.start().await?;
/// println!("listening on {addr}");
/// # Ok(())
/// # }
/// ```
pub struct SyncServer {
    shared: Arc<ServerShared>,
    trigger: ShutdownTrigger,
    running: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
}

impl SyncServer {
    /// Creates a stopped server.
    pub fn new<R: RequestResolver>(config: ServerConfig, resolver: R) -> Self {
        Self::with_resolver(config, Arc::new(resolver))
    }

    /// Creates a stopped server over a shared resolver.
    pub fn with_resolver(config: ServerConfig, resolver: Arc<dyn RequestResolver>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let limit = Arc::new(Semaphore::new(config.max_connections));
        let (trigger, _) = shutdown_channel();
        Self {
            shared: Arc::new(ServerShared {
                config,
                resolver,
                connections: DashMap::new(),
                next_connection: AtomicU64::new(1),
                events,
                limit,
            }),
            trigger,
            running: Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&self) -> ServerResult<SocketAddr> {
        if self.trigger.is_triggered() {
            return Err(ServerError::Internal("server has been shut down".into()));
        }
        if self.running.lock().is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.shared.config.bind_addr).await?;
        let addr = listener.local_addr()?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let handle = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            self.trigger.subscribe(),
        ));
        *running = Some((addr, handle));

        info!(%addr, "sync server listening");
        Ok(addr)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|(addr, _)| *addr)
    }

    /// Returns true between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        !self.trigger.is_triggered() && self.running.lock().is_some()
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Client ids announced by open connections.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .shared
            .connections
            .iter()
            .filter_map(|entry| entry.value().client_id())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Queues `package` on every open connection.
    ///
    /// Returns the number of connections it was queued on.
    pub fn broadcast(&self, package: &WirePackage) -> usize {
        self.shared.relay(None, package)
    }

    /// Queues `package` on the connections of `client_id`.
    ///
    /// Returns false if no open connection announced that id.
    pub fn send_to(&self, client_id: &str, package: &WirePackage) -> bool {
        let targets: Vec<_> = self
            .shared
            .connections
            .iter()
            .filter(|entry| entry.value().client_id().as_deref() == Some(client_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        targets
            .iter()
            .filter(|stream| stream.add_to_queue(package.clone()).is_ok())
            .count()
            > 0
    }

    /// Stops accepting and closes every connection. Idempotent.
    pub fn shutdown(&self) {
        if self.trigger.is_triggered() {
            return;
        }
        self.trigger.trigger();

        let streams: Vec<_> = self
            .shared
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stream in &streams {
            stream.close();
        }
        info!(connections = streams.len(), "sync server shut down");
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl ServerShared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn relay(&self, from: Option<ConnectionId>, package: &WirePackage) -> usize {
        let targets: Vec<_> = self
            .connections
            .iter()
            .filter(|entry| Some(*entry.key()) != from)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        targets
            .iter()
            .filter(|stream| stream.add_to_queue(package.clone()).is_ok())
            .count()
    }

    fn adopt_client_id(&self, connection: ConnectionId, stream: &TransportStream, package: &WirePackage) {
        if stream.client_id().is_some() {
            return;
        }
        if let Some(client_id) = package.client_id.as_deref().filter(|id| !id.is_empty()) {
            stream.set_client_id(client_id);
            debug!(connection, client_id, "client identified");
            self.emit(ServerEvent::ClientIdentified {
                connection,
                client_id: client_id.to_string(),
            });
        }
    }

    async fn answer_fetch(&self, connection: ConnectionId, stream: &TransportStream, request: WirePackage) {
        let mut response = WirePackage::response_to(&request);
        let fallback = request.fetch.as_ref().map(|spec| spec.request_only()).unwrap_or_default();

        let resolver = Arc::clone(&self.resolver);
        let spec = match tokio::task::spawn_blocking(move || resolver.resolve_fetch(&request)).await {
            Ok(spec) => spec,
            Err(e) => {
                error!(connection, error = %e, "fetch resolver panicked");
                self.emit(ServerEvent::Error {
                    connection,
                    message: e.to_string(),
                });
                let mut spec = fallback;
                spec.result_error = Some(format!("fetch resolver failed: {e}"));
                spec
            }
        };
        response.fetch = Some(spec);

        if !stream.write_package(&response).await {
            debug!(connection, package_id = %response.id, "fetch response not delivered");
        }
    }

    async fn answer_authentication(
        self: Arc<Self>,
        connection: ConnectionId,
        stream: Arc<TransportStream>,
        request: WirePackage,
    ) {
        let mut response = WirePackage::response_to(&request);
        let outcome = match request.authentication {
            Some(credentials) => {
                let user_name = credentials.user_name.clone();
                let resolver = Arc::clone(&self.resolver);
                tokio::task::spawn_blocking(move || resolver.authenticate(&credentials))
                    .await
                    .unwrap_or_else(|e| {
                        error!(connection, error = %e, "authenticator panicked");
                        AuthenticationPayload::failure(user_name, "authentication failed")
                    })
            }
            None => AuthenticationPayload::failure("", "authenticate package carries no credentials"),
        };

        self.emit(ServerEvent::Authenticated {
            connection,
            user_name: outcome.user_name.clone(),
            success: outcome.success,
        });
        response.authentication = Some(outcome);

        if let Err(e) = stream.add_to_queue(response) {
            debug!(connection, error = %e, "authentication answer not queued");
        }
    }

    async fn apply_streamed(&self, connection: ConnectionId, package: WirePackage) {
        let resolver = Arc::clone(&self.resolver);
        let applied = tokio::task::spawn_blocking(move || {
            let result = resolver.apply_stream(&package);
            (package, result)
        })
        .await;

        match applied {
            Ok((package, Ok(()))) => {
                trace!(connection, package_id = %package.id, "streamed package applied");
                self.emit(ServerEvent::StreamApplied {
                    connection,
                    package_id: package.id,
                });
                if self.config.relay_streaming {
                    let relayed = self.relay(Some(connection), &package);
                    trace!(connection, relayed, "streamed package relayed");
                }
            }
            Ok((package, Err(e))) => {
                warn!(connection, package_id = %package.id, error = %e, "streamed package rejected");
                self.emit(ServerEvent::Error {
                    connection,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                error!(connection, error = %e, "stream resolver panicked");
                self.emit(ServerEvent::Error {
                    connection,
                    message: e.to_string(),
                });
            }
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, mut shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&shared.limit).try_acquire_owned() else {
            warn!(%peer, max = shared.config.max_connections, "connection limit reached, refusing peer");
            continue;
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = match TransportStream::open(socket, shared.config.transport.clone(), events_tx) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                warn!(%peer, error = %e, "could not open stream");
                continue;
            }
        };
        stream.arm_guard();

        let connection = shared.next_connection.fetch_add(1, Ordering::Relaxed);
        shared.connections.insert(connection, Arc::clone(&stream));
        info!(connection, %peer, "client connected");
        shared.emit(ServerEvent::ClientConnected { connection, peer });

        tokio::spawn(watch_stream(connection, Arc::downgrade(&stream), events_rx));
        tokio::spawn(handle_connection(Arc::clone(&shared), connection, stream, permit));
    }
    debug!("accept loop stopped");
}

async fn watch_stream(
    connection: ConnectionId,
    stream: Weak<TransportStream>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::PackageSent(package) => {
                trace!(connection, package_id = %package.id, "package sent");
            }
            StreamEvent::ConnectionLost => {
                debug!(connection, "liveness probe failed, closing");
                if let Some(stream) = stream.upgrade() {
                    stream.close();
                }
            }
            StreamEvent::Error(message) => {
                warn!(connection, %message, "outbound queue error");
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    connection: ConnectionId,
    stream: Arc<TransportStream>,
    _permit: OwnedSemaphorePermit,
) {
    let (streamed_tx, mut streamed_rx) = mpsc::unbounded_channel::<WirePackage>();
    let applier = {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(package) = streamed_rx.recv().await {
                shared.apply_streamed(connection, package).await;
            }
        })
    };

    loop {
        let package = match stream.receive_package().await {
            Ok(package) => package,
            Err(e) => {
                debug!(connection, error = %e, "connection handler exiting");
                break;
            }
        };
        shared.adopt_client_id(connection, &stream, &package);

        match package.kind {
            PackageKind::Fetch => shared.answer_fetch(connection, &stream, package).await,
            PackageKind::Authenticate => {
                tokio::spawn(Arc::clone(&shared).answer_authentication(
                    connection,
                    Arc::clone(&stream),
                    package,
                ));
            }
            PackageKind::Command | PackageKind::FetchResult => {
                if streamed_tx.send(package).is_err() {
                    break;
                }
            }
        }
    }

    drop(streamed_tx);
    shared.connections.remove(&connection);
    stream.close();
    if applier.await.is_err() {
        error!(connection, "stream applier panicked");
    }

    let client_id = stream.client_id();
    info!(connection, client_id = ?client_id, "client disconnected");
    shared.emit(ServerEvent::ClientDisconnected { connection, client_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StoreResolver;
    use tether_storage::InMemoryStore;

    fn server() -> SyncServer {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        SyncServer::new(config, StoreResolver::new(Arc::new(InMemoryStore::new())))
    }

    #[tokio::test]
    async fn server_lifecycle() {
        let server = server();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));

        server.shutdown();
        server.shutdown();
        assert!(!server.is_running());
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn broadcast_without_clients() {
        let server = server();
        server.start().await.unwrap();
        let package = WirePackage::new(PackageKind::Command);
        assert_eq!(server.broadcast(&package), 0);
        assert!(!server.send_to("nobody", &package));
        assert!(server.client_ids().is_empty());
    }

    #[tokio::test]
    async fn accepted_connection_is_tracked() {
        let server = server();
        let addr = server.start().await.unwrap();
        let mut events = server.subscribe();

        let socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            ServerEvent::ClientConnected { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(server.connection_count(), 1);

        drop(socket);
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::ClientDisconnected { client_id, .. } = event {
                assert_eq!(client_id, None);
                break;
            }
        }
        assert_eq!(server.connection_count(), 0);
    }
}
