//! Tether CLI
//!
//! Command-line tools for running and probing tether sync servers.
//!
//! # Commands
//!
//! - `serve` - Run a sync server over an in-memory store
//! - `ping` - Connect to a server and probe the connection
//! - `fetch` - Fetch entities or ids from a server

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Tether sync tools.
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output (overrides RUST_LOG)
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync server over an in-memory store
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Accepted login as NAME:PASSWORD (repeatable)
        #[arg(short, long = "user", value_name = "NAME:PASSWORD")]
        users: Vec<String>,

        /// Secret for signing session tokens (required with --user)
        #[arg(long)]
        secret: Option<String>,

        /// Forward streamed commands to every other connected client
        #[arg(short, long)]
        relay: bool,

        /// Maximum concurrent connections
        #[arg(long, default_value = "1000")]
        max_connections: usize,
    },

    /// Connect to a server and probe the connection
    Ping {
        /// Server address
        #[arg(short, long)]
        remote: SocketAddr,

        /// Connect timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Fetch entities or ids from a server
    Fetch {
        /// Server address
        #[arg(short, long)]
        remote: SocketAddr,

        /// Type descriptor to fetch
        #[arg(short = 't', long = "type")]
        type_descriptor: String,

        /// Page size (0 fetches everything)
        #[arg(long, default_value = "0")]
        take: u32,

        /// Entities to skip
        #[arg(long, default_value = "0")]
        skip: u32,

        /// Predicate, e.g. "Archived = false AND Age > 30"
        #[arg(short, long)]
        query: Option<String>,

        /// Include related entities
        #[arg(long)]
        include_all: bool,

        /// Fetch ids only
        #[arg(long)]
        ids_only: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            users,
            secret,
            relay,
            max_connections,
        } => {
            commands::serve::run(bind, &users, secret.as_deref(), relay, max_connections).await?;
        }
        Commands::Ping {
            remote,
            timeout,
            format,
        } => {
            commands::ping::run(remote, timeout, &format).await?;
        }
        Commands::Fetch {
            remote,
            type_descriptor,
            take,
            skip,
            query,
            include_all,
            ids_only,
            format,
        } => {
            let request = commands::fetch::FetchRequest {
                type_descriptor,
                take,
                skip,
                query,
                include_all,
                ids_only,
            };
            commands::fetch::run(remote, request, &format).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fetch_arguments_parse() {
        let cli = Cli::try_parse_from([
            "tether",
            "fetch",
            "--remote",
            "127.0.0.1:9000",
            "--type",
            "Person",
            "--take",
            "10",
            "--query",
            "Age > 30",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch {
                type_descriptor,
                take,
                query,
                format,
                ..
            } => {
                assert_eq!(type_descriptor, "Person");
                assert_eq!(take, 10);
                assert_eq!(query.as_deref(), Some("Age > 30"));
                assert_eq!(format, "json");
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn users_are_repeatable() {
        let cli = Cli::try_parse_from([
            "tether", "serve", "--user", "ada:pw1", "--user", "grace:pw2", "--secret", "s",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { users, .. } => assert_eq!(users.len(), 2),
            _ => panic!("expected serve"),
        }
    }
}
