//! Live server harness.

use crate::fixtures::fast_transport_config;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_model::Entity;
use tether_storage::{EntityStore, InMemoryStore};
use tether_sync_server::{
    AuthConfig, CredentialAuthenticator, ServerConfig, StoreResolver, SyncServer,
};

/// A running sync server over an in-memory store, bound to a free loopback
/// port. Shut down on drop.
#[derive(Debug)]
pub struct TestServer {
    server: SyncServer,
    store: Arc<InMemoryStore>,
    addr: SocketAddr,
}

impl TestServer {
    /// Starts an open server.
    pub async fn start() -> Self {
        Self::start_with(test_server_config(), None).await
    }

    /// Starts a server that relays streamed commands to other clients.
    pub async fn start_relaying() -> Self {
        Self::start_with(test_server_config().with_relay_streaming(true), None).await
    }

    /// Starts a server that accepts exactly one user.
    pub async fn start_with_user(user_name: &str, password: &str) -> Self {
        let auth = CredentialAuthenticator::new(AuthConfig::new(b"testkit-secret".to_vec()))
            .with_user(user_name, password);
        Self::start_with(test_server_config(), Some(auth)).await
    }

    /// Starts a server with an explicit configuration.
    pub async fn start_with(
        config: ServerConfig,
        authenticator: Option<CredentialAuthenticator>,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let mut resolver = StoreResolver::new(Arc::clone(&store));
        if let Some(auth) = authenticator {
            resolver = resolver.with_authenticator(Arc::new(auth));
        }
        let server = SyncServer::new(config, resolver);
        let addr = server.start().await.expect("Failed to start test server");
        Self {
            server,
            store,
            addr,
        }
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The store behind the server.
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    /// The server itself.
    pub fn server(&self) -> &SyncServer {
        &self.server
    }

    /// Writes `entity` straight into the server's store.
    pub fn seed(&self, entity: Entity) -> Entity {
        self.store
            .ensure_schema(&entity.type_descriptor)
            .expect("Failed to prepare schema");
        self.store.create(&entity).expect("Failed to seed entity");
        entity
    }
}

/// Server settings bound to `127.0.0.1:0` with fast transport timings.
pub fn test_server_config() -> ServerConfig {
    ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
        .with_transport(fast_transport_config())
}
