//! Source Binary
//!
//! Runs one probe cycle against the balancer and reports mean response time
//! and sample standard deviation. The probe count and 1-second pacing are
//! fixed protocol parameters, not flags.
//!
//! Usage:
//!   source --host lb1 --port 4000
//!
//! Environment:
//!   HOST - Balancer host (default: lb1)
//!   PORT - Balancer port (default: 4000)

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use hoptrace::{Source, SourceConfig};

#[derive(Parser, Debug)]
#[command(name = "source")]
#[command(about = "Latency probe source")]
struct Args {
    /// Balancer host
    #[arg(long, env = "HOST", default_value = "lb1")]
    host: String,

    /// Balancer port
    #[arg(long, env = "PORT", default_value = "4000")]
    port: u16,

    /// Cycle identifier for this run
    #[arg(long, env = "CYCLE_ID", default_value = "1")]
    cycle_id: u64,

    /// Hop triplets the deployed chain is expected to stamp per reply
    #[arg(long, env = "EXPECTED_HOPS", default_value = "4")]
    expected_hops: usize,

    /// Seconds to wait before connecting, so the chain can come up first
    #[arg(long, env = "STARTUP_DELAY_SEC", default_value = "15")]
    startup_delay_sec: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();

    info!(
        "[SOURCE] connecting to balancer {}:{} in {} seconds",
        args.host, args.port, args.startup_delay_sec
    );
    tokio::time::sleep(Duration::from_secs(args.startup_delay_sec)).await;

    let config = SourceConfig {
        balancer_host: args.host,
        balancer_port: args.port,
        cycle_id: args.cycle_id,
        expected_hops: args.expected_hops,
        ..Default::default()
    };

    let run = async {
        let mut source = Source::connect(config).await?;
        source.run_cycle().await
    };

    tokio::select! {
        result = run => {
            let report = result?;
            info!(
                "[SOURCE] cycle complete: mrt={} ms std={} ms over {} probes",
                report.mrt,
                report.std,
                report.samples.len()
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("[SOURCE] shutting down");
            Ok(())
        }
    }
}
