//! Server configuration.

use std::net::SocketAddr;
use tether_transport::TransportConfig;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Forward accepted commands to every other connected client.
    pub relay_streaming: bool,
    /// Capacity of the server event channel.
    pub event_capacity: usize,
    /// Per-connection transport settings.
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            relay_streaming: false,
            event_capacity: 256,
            transport: TransportConfig::default(),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Enables or disables relaying of streamed commands.
    pub fn with_relay_streaming(mut self, relay: bool) -> Self {
        self.relay_streaming = relay;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert!(!config.relay_streaming);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_connections(8)
            .with_relay_streaming(true)
            .with_transport(TransportConfig::default().with_send_buffer_size(1024));

        assert_eq!(config.max_connections, 8);
        assert!(config.relay_streaming);
        assert_eq!(config.transport.send_buffer_size, 1024);
    }
}
