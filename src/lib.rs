//! rperf2 - a threaded Rust implementation of iperf2-style network
//! performance measurement
//!
//! Traffic threads drive TCP or UDP flows and hand per-packet records to
//! a single reporter thread over lock-free rings; the reporter maintains
//! interval and cumulative statistics (throughput, loss, jitter, latency
//! distributions) and emits the familiar report rows. A compact
//! big-endian negotiation header lets a client ask the listener for
//! dual, trade-off, reverse and bidirectional tests.
//!
//! # Features
//!
//! - TCP and UDP throughput testing with parallel streams
//! - Periodic interval reports with per-group SUM rows
//! - UDP loss, reordering, RFC 1889 jitter and one-way latency stats
//! - Isochronous (frames-per-second) traffic with latency histograms
//! - Offered-load pacing in bits/sec or packets/sec

pub mod client;
pub mod config;
pub mod error;
pub mod histogram;
pub mod isoch;
pub mod output;
pub mod packet_ring;
pub mod protocol;
pub mod report;
pub mod reporter;
pub mod server;
pub mod stats;
pub mod timing;
pub mod token_bucket;

pub use client::Client;
pub use config::{Config, Mode, Protocol};
pub use error::{Error, Result};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
