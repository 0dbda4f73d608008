//! hoptrace — hop-stamped latency measurement chain.
//!
//! A probe source sends cyclic frames through a round-robin balancer to a
//! tier of relay services; every hop appends a `(received_ts, delay_ms,
//! sent_ts)` triplet so the source can reconstruct per-hop and aggregate
//! delay statistics.
//!
//! The library exposes the shared wire codec and the three participants;
//! the `balancer`, `service`, and `source` binaries wire them to the CLI.

pub mod addr;
pub mod balancer;
pub mod service;
pub mod source;
pub mod stats;
pub mod wire;

pub use addr::BackendAddr;
pub use balancer::{Balancer, BalancerConfig, Rotation};
pub use service::{ReplyPath, Service, ServiceConfig, SideActivity};
pub use source::{CycleReport, Source, SourceConfig};
pub use wire::{Frame, HopStamp, WireError};
