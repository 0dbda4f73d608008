//! Balancer Binary
//!
//! Round-robin relay between probe sources and the service tier.
//!
//! Usage:
//!   balancer --listen-port 4000 --servers localhost:5000,localhost:5001
//!
//! Environment:
//!   LISTEN_HOST - Listen host (default: localhost)
//!   LISTEN_PORT - Listen port (default: 4000)
//!   SERVERS     - Comma-separated backend host:port list
//!   LB_ID       - Numeric identity used in log lines (default: 1)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use hoptrace::{Balancer, BalancerConfig, BackendAddr};

#[derive(Parser, Debug)]
#[command(name = "balancer")]
#[command(about = "Round-robin latency probe relay")]
struct Args {
    /// Listen host
    #[arg(long, env = "LISTEN_HOST", default_value = "localhost")]
    listen_host: String,

    /// Listen port
    #[arg(long, env = "LISTEN_PORT", default_value = "4000")]
    listen_port: u16,

    /// Backends as host:port, comma-separated
    #[arg(
        long,
        env = "SERVERS",
        default_value = "localhost:5000,localhost:5001",
        value_delimiter = ','
    )]
    servers: Vec<BackendAddr>,

    /// Balancer identity for log lines
    #[arg(long, env = "LB_ID", default_value = "1")]
    lb_id: u32,

    /// Cap on concurrent client connections (default: unbounded)
    #[arg(long, env = "LB_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Backend connect timeout in milliseconds (default: none)
    #[arg(long, env = "LB_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Backend response timeout in milliseconds (default: none)
    #[arg(long, env = "LB_READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = BalancerConfig {
        listen_host: args.listen_host,
        listen_port: args.listen_port,
        backends: args.servers,
        balancer_id: args.lb_id,
        max_connections: args.max_connections,
        connect_timeout: args.connect_timeout_ms.map(Duration::from_millis),
        read_timeout: args.read_timeout_ms.map(Duration::from_millis),
    };

    let balancer = Arc::new(Balancer::bind(config).await?);

    tokio::select! {
        result = balancer.clone().run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("[LB-{}] shutting down", args.lb_id);
            Ok(())
        }
    }
}
