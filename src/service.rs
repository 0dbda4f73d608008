//! Relay Service
//!
//! Accepts one frame per connection, runs an opaque side activity, stamps the
//! frame, and replies either with a forwarded next-hop response or with the
//! locally stamped frame. Forwarding is best-effort: an unreachable next hop
//! falls back to the local reply instead of failing the request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::addr::BackendAddr;
use crate::wire::{local_now, Frame};

const READ_BUF_SIZE: usize = 1024;

/// Opaque pre-reply work a service may run (a deployment might do an
/// inference pass here). It never sees the frame and has no observable
/// effect on routing or message content.
pub trait SideActivity: Send + Sync + 'static {
    fn run(&self);
}

/// Default side activity: nothing.
pub struct NoActivity;

impl SideActivity for NoActivity {
    fn run(&self) {}
}

/// Configuration for a relay service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Optional next hop for chained forwarding.
    pub forward: Option<BackendAddr>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            forward: None,
        }
    }
}

/// Which branch produced the reply for one handled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPath {
    /// Next hop answered; its response was relayed verbatim.
    Forwarded,
    /// Local stamp was sent (no forward configured, or forward failed).
    Local,
}

/// Service counters, shared across connection tasks.
#[derive(Debug, Default)]
pub struct ServiceStats {
    pub connections_accepted: AtomicU64,
    pub empty_reads: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub forwarded_replies: AtomicU64,
    pub local_replies: AtomicU64,
}

impl ServiceStats {
    pub fn snapshot(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            forwarded_replies: self.forwarded_replies.load(Ordering::Relaxed),
            local_replies: self.local_replies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatsSnapshot {
    pub connections_accepted: u64,
    pub empty_reads: u64,
    pub malformed_frames: u64,
    pub forwarded_replies: u64,
    pub local_replies: u64,
}

/// One hop in the service tier.
pub struct Service {
    config: ServiceConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    stats: Arc<ServiceStats>,
    activity: Arc<dyn SideActivity>,
}

impl Service {
    /// Bind the listening socket. Bind failure is fatal by design.
    pub async fn bind(config: ServiceConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            config,
            listener,
            local_addr,
            stats: Arc::new(ServiceStats::default()),
            activity: Arc::new(NoActivity),
        })
    }

    /// Replace the side activity hook.
    pub fn with_activity(mut self, activity: Arc<dyn SideActivity>) -> Self {
        self.activity = activity;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServiceStats> {
        self.stats.clone()
    }

    /// Accept loop. Each connection gets its own task and carries exactly
    /// one request/response; frames from different connections never
    /// interleave.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let port = self.local_addr.port();
        info!("[SERVICE-{}] waiting for connections on {}", port, self.local_addr);

        loop {
            let (conn, peer) = self.listener.accept().await?;
            info!("[SERVICE-{}] connected with {}", port, peer);
            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_conn(conn).await {
                    warn!("[SERVICE-{}] connection {} ended with error: {}", port, peer, e);
                }
            });
        }
    }

    /// Handle one connection: read one frame, stamp, reply.
    async fn handle_conn(&self, mut conn: TcpStream) -> Result<Option<ReplyPath>> {
        let port = self.local_addr.port();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        let n = conn.read(&mut buf).await?;
        if n == 0 {
            debug!("[SERVICE-{}] empty read, skipping", port);
            self.stats.empty_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.activity.run();

        let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
        let mut frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                // No reply for a malformed message; the listener stays up.
                error!("[SERVICE-{}] malformed frame: {} ({:?})", port, e, raw.trim());
                self.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        let received_ts = local_now();
        let sent_ts = local_now();
        frame.stamp(received_ts, sent_ts);
        let local_payload = frame.encode();

        let path = match &self.config.forward {
            Some(next_hop) => match self.forward(next_hop, local_payload.as_bytes()).await {
                Ok(response) => {
                    conn.write_all(&response).await?;
                    self.stats.forwarded_replies.fetch_add(1, Ordering::Relaxed);
                    ReplyPath::Forwarded
                }
                Err(e) => {
                    error!(
                        "[SERVICE-{}] forward service {} unavailable: {}",
                        port, next_hop, e
                    );
                    conn.write_all(local_payload.as_bytes()).await?;
                    self.stats.local_replies.fetch_add(1, Ordering::Relaxed);
                    ReplyPath::Local
                }
            },
            None => {
                conn.write_all(local_payload.as_bytes()).await?;
                self.stats.local_replies.fetch_add(1, Ordering::Relaxed);
                ReplyPath::Local
            }
        };

        info!("[SERVICE-{}] replying via {:?}", port, path);
        Ok(Some(path))
    }

    /// Forward the stamped frame to the next hop and wait for one response.
    async fn forward(&self, next_hop: &BackendAddr, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect((next_hop.host.as_str(), next_hop.port)).await?;
        stream.write_all(payload).await?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = stream.read(&mut buf).await?;
        anyhow::ensure!(n > 0, "next hop {} closed without responding", next_hop);

        buf.truncate(n);
        Ok(buf)
    }
}
