//! Ping command implementation.

use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Ping result.
#[derive(Debug, Serialize)]
pub struct PingReport {
    /// Server address.
    pub remote: String,
    /// Client id announced to the server.
    pub client_id: String,
    /// Time to establish the connection, in milliseconds.
    pub connect_ms: u128,
    /// Whether the liveness probe succeeded.
    pub alive: bool,
    /// Time taken by the probe, in milliseconds.
    pub probe_ms: u128,
}

/// Runs the ping command.
pub async fn run(
    remote: SocketAddr,
    timeout_secs: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = super::one_shot_client(remote, Duration::from_secs(timeout_secs));

    let started = Instant::now();
    client.connect().await?;
    let connect_ms = started.elapsed().as_millis();

    let started = Instant::now();
    let alive = client.check_connection().await;
    let report = PingReport {
        remote: remote.to_string(),
        client_id: client.client_id().to_string(),
        connect_ms,
        alive,
        probe_ms: started.elapsed().as_millis(),
    };
    client.shutdown();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }

    if alive {
        Ok(())
    } else {
        Err(format!("{remote} did not answer the liveness probe").into())
    }
}

fn print_report(report: &PingReport) {
    println!("Ping {}", report.remote);
    println!("  connected in {} ms as {}", report.connect_ms, report.client_id);
    let status = if report.alive { "alive" } else { "dead" };
    println!("  probe: {} ({} ms)", status, report.probe_ms);
}
