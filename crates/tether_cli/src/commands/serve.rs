//! Serve command implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tether_storage::InMemoryStore;
use tether_sync_server::{
    AuthConfig, CredentialAuthenticator, ServerConfig, ServerEvent, StoreResolver, SyncServer,
};
use tracing::{info, warn};

/// Splits a `NAME:PASSWORD` argument.
pub fn parse_user(arg: &str) -> Result<(&str, &str), String> {
    match arg.split_once(':') {
        Some((name, password)) if !name.is_empty() && !password.is_empty() => Ok((name, password)),
        _ => Err(format!("expected NAME:PASSWORD, got {arg:?}")),
    }
}

/// Runs the serve command until Ctrl-C.
pub async fn run(
    bind: SocketAddr,
    users: &[String],
    secret: Option<&str>,
    relay: bool,
    max_connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryStore::new());
    let mut resolver = StoreResolver::new(store);

    if !users.is_empty() {
        let secret = secret.ok_or("--secret is required with --user")?;
        let authenticator = CredentialAuthenticator::new(AuthConfig::new(secret.as_bytes().to_vec()));
        for arg in users {
            let (name, password) = parse_user(arg)?;
            authenticator.add_user(name, password);
        }
        info!(users = authenticator.user_count(), "authentication enabled");
        resolver = resolver.with_authenticator(Arc::new(authenticator));
    }

    let config = ServerConfig::new(bind)
        .with_relay_streaming(relay)
        .with_max_connections(max_connections);
    let server = SyncServer::new(config, resolver);
    let mut events = server.subscribe();
    let addr = server.start().await?;
    println!("tether server listening on {addr} (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "server events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    server.shutdown();
    println!("stopped");
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientIdentified {
            connection,
            client_id,
        } => info!(connection, client_id, "client identified"),
        ServerEvent::Authenticated {
            connection,
            user_name,
            success,
        } => info!(connection, user_name, success, "login answered"),
        ServerEvent::Error {
            connection,
            message,
        } => warn!(connection, %message, "request failed"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_arguments() {
        assert_eq!(parse_user("ada:lovelace"), Ok(("ada", "lovelace")));
        assert_eq!(parse_user("ada:pass:word"), Ok(("ada", "pass:word")));
        assert!(parse_user("ada").is_err());
        assert!(parse_user(":pw").is_err());
        assert!(parse_user("ada:").is_err());
    }
}
