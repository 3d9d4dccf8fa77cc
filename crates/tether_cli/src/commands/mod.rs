//! CLI command implementations.

pub mod fetch;
pub mod ping;
pub mod serve;

use std::net::SocketAddr;
use std::time::Duration;
use tether_sync_engine::{ClientConfig, SyncClient};

/// A one-shot client that never reconnects.
fn one_shot_client(remote: SocketAddr, connect_timeout: Duration) -> SyncClient {
    let client_id = format!("tether-cli-{}", std::process::id());
    SyncClient::new(
        ClientConfig::new(remote, client_id)
            .with_connect_timeout(connect_timeout)
            .with_reconnect(false),
    )
}
