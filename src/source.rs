//! Probe Client (Source)
//!
//! Drives a fixed-length cycle of probes over one persistent connection to
//! the balancer and reconstructs aggregate delay statistics from the stamped
//! replies.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::stats;
use crate::wire::{local_now, Frame, FIELD_DELIMITER};

const READ_BUF_SIZE: usize = 1024;

/// Configuration for one probe source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceConfig {
    pub balancer_host: String,
    pub balancer_port: u16,
    /// Identifies this logical run of probes.
    pub cycle_id: u64,
    pub probes_per_cycle: usize,
    /// Pacing between probes.
    pub probe_interval: Duration,
    /// Chain depth this source expects its replies to carry. Validated
    /// against every reply; a mismatch is an extraction failure, never an
    /// out-of-bounds read.
    pub expected_hops: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            balancer_host: "lb1".to_string(),
            balancer_port: 4000,
            cycle_id: 1,
            probes_per_cycle: 5,
            probe_interval: Duration::from_secs(1),
            expected_hops: 4,
        }
    }
}

/// Aggregate statistics for one completed cycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleReport {
    /// Per-probe response-time samples, in probe order. Failed extractions
    /// contribute 0.
    pub samples: Vec<f64>,
    /// Mean response time, ms.
    pub mrt: f64,
    /// Bessel-corrected sample standard deviation, ms.
    pub std: f64,
}

/// The probe source. Single-threaded, strictly sequential: one outstanding
/// request at a time.
pub struct Source {
    config: SourceConfig,
    stream: TcpStream,
}

impl Source {
    /// Open the persistent connection to the balancer.
    pub async fn connect(config: SourceConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.balancer_host.as_str(), config.balancer_port))
            .await
            .with_context(|| {
                format!(
                    "failed to connect to balancer {}:{}",
                    config.balancer_host, config.balancer_port
                )
            })?;
        info!(
            "[SOURCE] connected to balancer {}:{}",
            config.balancer_host, config.balancer_port
        );
        Ok(Self { config, stream })
    }

    /// Run one full probe cycle and report its statistics.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let total = self.config.probes_per_cycle;
        let mut samples = Vec::with_capacity(total);
        let mut buf = vec![0u8; READ_BUF_SIZE];

        for message_id in 1..=total as u64 {
            let frame = Frame::new(self.config.cycle_id, message_id, local_now());
            let mut payload = frame.encode();
            payload.push(FIELD_DELIMITER);

            self.stream.write_all(payload.as_bytes()).await?;
            info!("[SOURCE] -> [LB]: {}", payload);

            let n = self.stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "balancer closed the connection mid-cycle");
            let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
            info!("[SOURCE] <- [SERVICE]: {}", reply);

            let sample = match extract_probe_sample(&reply, self.config.expected_hops) {
                Some(ms) => ms,
                None => {
                    warn!(
                        "[SOURCE] could not extract response time from reply (expected {} hops): {:?}",
                        self.config.expected_hops,
                        reply.trim()
                    );
                    0.0
                }
            };
            samples.push(sample);

            sleep(self.config.probe_interval).await;
        }

        let mrt = stats::mean(&samples);
        let std = stats::sample_std_dev(&samples);
        info!("[SOURCE] mean response time (MRT): {} ms", mrt);
        info!("[SOURCE] standard deviation (STD): {} ms", std);

        Ok(CycleReport { samples, mrt, std })
    }
}

/// Average the per-hop delay fields of a reply.
///
/// Returns `None` when the reply is not a frame (for example the balancer's
/// plain-text unavailability notice) or does not carry exactly the expected
/// number of hop triplets.
pub fn extract_probe_sample(reply: &str, expected_hops: usize) -> Option<f64> {
    if expected_hops == 0 {
        return None;
    }
    let frame = Frame::decode(reply).ok()?;
    if frame.hops.len() != expected_hops {
        return None;
    }
    let sum: f64 = frame.hops.iter().map(|h| h.delay_ms).sum();
    Some(sum / expected_hops as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parse_ts;

    fn stamped_reply(hops: usize) -> String {
        let mut frame = Frame::new(1, 1, parse_ts("2024-01-01T00:00:00.000000").unwrap());
        for i in 0..hops {
            let received =
                parse_ts(&format!("2024-01-01T00:00:0{}.100000", i)).unwrap();
            let sent = parse_ts(&format!("2024-01-01T00:00:0{}.200000", i)).unwrap();
            frame.stamp(received, sent);
        }
        frame.encode()
    }

    #[test]
    fn test_extract_averages_expected_hop_delays() {
        let reply = stamped_reply(4);
        // Hop delays: 100ms, then 900ms between each sent/received pair.
        let expected = (100.0 + 900.0 + 900.0 + 900.0) / 4.0;
        let sample = extract_probe_sample(&reply, 4).unwrap();
        assert!((sample - expected).abs() < 1e-9);
    }

    #[test]
    fn test_extract_fails_on_shallower_chain() {
        // One hop present, four expected: boundary case of a
        // shallower-than-assumed chain.
        let reply = stamped_reply(1);
        assert_eq!(extract_probe_sample(&reply, 4), None);
    }

    #[test]
    fn test_extract_fails_on_deeper_chain() {
        let reply = stamped_reply(5);
        assert_eq!(extract_probe_sample(&reply, 4), None);
    }

    #[test]
    fn test_extract_fails_on_unavailability_notice() {
        assert_eq!(
            extract_probe_sample("localhost:5000 unavailable", 4),
            None
        );
    }

    #[test]
    fn test_failed_extraction_contributes_zero_sample() {
        let samples = vec![
            extract_probe_sample(&stamped_reply(1), 4).unwrap_or(0.0),
            extract_probe_sample(&stamped_reply(4), 4).unwrap_or(0.0),
        ];
        assert_eq!(samples[0], 0.0);
        assert!(samples[1] > 0.0);
    }
}
