//! Service Binary
//!
//! Relay service: stamps inbound frames and replies, optionally chaining
//! through a further forward service first.
//!
//! Usage:
//!   service --port 5000
//!   service --port 5000 --forward-host localhost --forward-port 6000
//!
//! Environment:
//!   SERVICE_HOST - Listen host (default: localhost)
//!   SERVICE_PORT - Listen port (default: 5000)
//!   FORWARD_HOST - Optional next-hop host
//!   FORWARD_PORT - Optional next-hop port

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use hoptrace::{BackendAddr, Service, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "service")]
#[command(about = "Hop-stamping relay service")]
struct Args {
    /// Listen host
    #[arg(long, env = "SERVICE_HOST", default_value = "localhost")]
    host: String,

    /// Listen port
    #[arg(long, env = "SERVICE_PORT", default_value = "5000")]
    port: u16,

    /// Next-hop host for chained forwarding
    #[arg(long, env = "FORWARD_HOST")]
    forward_host: Option<String>,

    /// Next-hop port for chained forwarding
    #[arg(long, env = "FORWARD_PORT")]
    forward_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();

    let forward = match (args.forward_host, args.forward_port) {
        (Some(host), Some(port)) => Some(BackendAddr::new(host, port)),
        (None, None) => None,
        _ => bail!("forward host and forward port must be given together"),
    };

    let config = ServiceConfig {
        host: args.host,
        port: args.port,
        forward,
    };

    let service = Arc::new(Service::bind(config).await?);
    let port = service.local_addr().port();

    tokio::select! {
        result = service.clone().run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("[SERVICE-{}] shutting down", port);
            Ok(())
        }
    }
}
