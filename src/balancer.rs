//! Balancer Core
//!
//! Accepts client connections, stamps every inbound frame, relays it to the
//! next backend in strict round-robin order, and relays the backend's raw
//! response back verbatim. One task per accepted connection; the rotation
//! index is the only shared mutable state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::addr::BackendAddr;
use crate::wire::{local_now, Frame};

/// Read buffer for a single frame exchange. Frames are short delimited text
/// and probes are strictly sequential per connection, so one read per
/// logical message suffices.
const READ_BUF_SIZE: usize = 1024;

/// Configuration for the balancer.
///
/// The `Option` fields are hardening knobs that default to off: the baseline
/// behavior is unbounded per-connection concurrency with no timeouts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BalancerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Ordered backend list, fixed for the life of the process.
    pub backends: Vec<BackendAddr>,
    /// Identity used only in log lines.
    pub balancer_id: u32,
    /// Cap on concurrently handled client connections.
    pub max_connections: Option<usize>,
    /// Timeout for connecting to a backend.
    pub connect_timeout: Option<Duration>,
    /// Timeout for reading a backend's response.
    pub read_timeout: Option<Duration>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen_host: "localhost".to_string(),
            listen_port: 4000,
            backends: vec![
                BackendAddr::new("localhost", 5000),
                BackendAddr::new("localhost", 5001),
            ],
            balancer_id: 1,
            max_connections: None,
            connect_timeout: None,
            read_timeout: None,
        }
    }
}

/// Strict round-robin selector over a fixed backend list.
///
/// The whole read-compute-advance runs under one lock, so no two selections
/// ever observe the same pre-increment index, and the index is never reset.
pub struct Rotation {
    backends: Vec<BackendAddr>,
    index: Mutex<usize>,
}

impl Rotation {
    pub fn new(backends: Vec<BackendAddr>) -> Self {
        assert!(!backends.is_empty(), "rotation needs at least one backend");
        Self {
            backends,
            index: Mutex::new(0),
        }
    }

    /// Next backend in rotation, with the index it was selected at.
    pub fn next(&self) -> (usize, BackendAddr) {
        let mut index = self.index.lock();
        let selected = *index;
        *index = (*index + 1) % self.backends.len();
        (selected, self.backends[selected].clone())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Relay counters, shared across connection tasks.
#[derive(Debug, Default)]
pub struct BalancerStats {
    pub connections_accepted: AtomicU64,
    pub frames_relayed: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub backend_failures: AtomicU64,
}

impl BalancerStats {
    pub fn snapshot(&self) -> BalancerStatsSnapshot {
        BalancerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BalancerStatsSnapshot {
    pub connections_accepted: u64,
    pub frames_relayed: u64,
    pub malformed_frames: u64,
    pub backend_failures: u64,
}

/// The round-robin relay.
pub struct Balancer {
    config: BalancerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    rotation: Arc<Rotation>,
    stats: Arc<BalancerStats>,
    limiter: Option<Arc<Semaphore>>,
}

impl Balancer {
    /// Bind the listening socket. Bind failure is fatal by design.
    pub async fn bind(config: BalancerConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.backends.is_empty(),
            "balancer requires at least one backend"
        );

        let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind {}:{}",
                    config.listen_host, config.listen_port
                )
            })?;
        let local_addr = listener.local_addr()?;
        let rotation = Arc::new(Rotation::new(config.backends.clone()));
        let limiter = config
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n)));

        Ok(Self {
            config,
            listener,
            local_addr,
            rotation,
            stats: Arc::new(BalancerStats::default()),
            limiter,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<BalancerStats> {
        self.stats.clone()
    }

    pub fn rotation(&self) -> Arc<Rotation> {
        self.rotation.clone()
    }

    /// Accept loop. Runs until the process is interrupted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let id = self.config.balancer_id;
        info!("[LB-{}] waiting for clients on {}", id, self.local_addr);

        loop {
            let (conn, peer) = self.listener.accept().await?;
            info!("[LB-{}] connected with {}", id, peer);
            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

            let permit = match &self.limiter {
                Some(semaphore) => Some(
                    semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| anyhow!("connection limiter closed"))?,
                ),
                None => None,
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_client(conn, peer).await {
                    warn!("[LB-{}] connection {} ended with error: {}", id, peer, e);
                }
                drop(permit);
            });
        }
    }

    /// Per-connection relay loop: one frame in, one response out, until the
    /// client closes the connection.
    async fn handle_client(&self, mut conn: TcpStream, peer: SocketAddr) -> Result<()> {
        let id = self.config.balancer_id;
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                debug!("[LB-{}] client {} closed the connection", id, peer);
                return Ok(());
            }

            let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
            let mut frame = match Frame::decode(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    // A single malformed message does not cost the client
                    // its connection.
                    error!("[LB-{}] malformed frame: {} ({:?})", id, e, raw.trim());
                    self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let received_ts = local_now();
            let sent_ts = local_now();
            frame.stamp(received_ts, sent_ts);

            let (_, backend) = self.rotation.next();
            let payload = frame.encode();
            info!("[LB-{}] forwarding to {}: {}", id, backend, payload);

            match self.exchange_with_backend(&backend, payload.as_bytes()).await {
                Ok(response) => {
                    // Already stamped by the backend; relay verbatim.
                    conn.write_all(&response).await?;
                    self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("[LB-{}] backend {} unavailable: {}", id, backend, e);
                    self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
                    let notice = format!("{} unavailable", backend);
                    conn.write_all(notice.as_bytes()).await?;
                }
            }
        }
    }

    /// Fresh connection per relay: connect, send, block for one response.
    async fn exchange_with_backend(
        &self,
        backend: &BackendAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let connect = TcpStream::connect((backend.host.as_str(), backend.port));
        let mut stream = match self.config.connect_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| anyhow!("connect to {} timed out", backend))??,
            None => connect.await?,
        };

        stream.write_all(payload).await?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let read = stream.read(&mut buf);
        let n = match self.config.read_timeout {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| anyhow!("response from {} timed out", backend))??,
            None => read.await?,
        };
        anyhow::ensure!(n > 0, "backend {} closed without responding", backend);

        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    fn backends(n: usize) -> Vec<BackendAddr> {
        (0..n).map(|i| BackendAddr::new("backend", i as u16)).collect()
    }

    #[test]
    fn test_rotation_strict_order_single_backend() {
        let rotation = Rotation::new(backends(1));
        for _ in 0..5 {
            assert_eq!(rotation.next().0, 0);
        }
    }

    #[test]
    fn test_rotation_strict_order_prime_length() {
        let rotation = Rotation::new(backends(7));
        let picks: Vec<usize> = (0..21).map(|_| rotation.next().0).collect();
        let expected: Vec<usize> = (0..21).map(|i| i % 7).collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn test_rotation_returns_matching_backend() {
        let rotation = Rotation::new(backends(3));
        for i in 0..6 {
            let (idx, addr) = rotation.next();
            assert_eq!(idx, i % 3);
            assert_eq!(addr.port, (i % 3) as u16);
        }
    }

    #[test]
    fn test_rotation_atomic_under_concurrency() {
        const THREADS: usize = 8;
        const PICKS_PER_THREAD: usize = 50;
        const BACKENDS: usize = 4;

        let rotation = Arc::new(Rotation::new(backends(BACKENDS)));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let rotation = rotation.clone();
                thread::spawn(move || {
                    (0..PICKS_PER_THREAD)
                        .map(|_| rotation.next().0)
                        .collect::<Vec<usize>>()
                })
            })
            .collect();

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for handle in handles {
            for idx in handle.join().unwrap() {
                *counts.entry(idx).or_default() += 1;
            }
        }

        // K selections over M backends: each index selected exactly K/M
        // times, none skipped, none duplicated beyond that.
        let total = THREADS * PICKS_PER_THREAD;
        assert_eq!(counts.len(), BACKENDS);
        for idx in 0..BACKENDS {
            assert_eq!(counts[&idx], total / BACKENDS, "index {}", idx);
        }
    }

    #[tokio::test]
    async fn test_bind_rejects_empty_backend_list() {
        let config = BalancerConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            backends: vec![],
            ..Default::default()
        };
        assert!(Balancer::bind(config).await.is_err());
    }
}
