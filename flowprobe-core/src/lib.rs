//! flowprobe Core - Network Flow Aggregation & Columnar Flow Database
//!
//! A lightweight flow aggregator: packets observed on network interfaces are
//! folded into in-memory 5-tuple flow maps, periodically rotated into a
//! compact columnar on-disk database, and queried analytically.
//!
//! # Architecture
//!
//! - **Flow map**: in-memory aggregation from 5-tuple key to four counters
//! - **Capture**: per-interface state machines driving ingestion and rotation
//! - **GPFile**: append-only single-column block files with JSON sidecars
//! - **DB writer**: decomposes a rotated flow map into eight column blocks
//! - **Query engine**: scans column files in lock-step, filters and aggregates

pub mod capture;
pub mod conditions;
pub mod db;
pub mod distributed;
pub mod encoder;
pub mod flowmap;
pub mod gpfile;
pub mod protocols;
pub mod query;

mod error;
mod types;

pub use error::{ProbeError, Result};
pub use types::*;

/// flowprobe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Rotation interval in seconds
    pub const ROTATION_INTERVAL: i64 = 300;

    /// Grace period for shutdown before outstanding writes are abandoned
    pub const SHUTDOWN_GRACE_PERIOD: std::time::Duration =
        std::time::Duration::from_secs(30);

    /// Maximum number of monitored interfaces
    pub const MAX_IFACES: usize = 1024;

    /// Maximum length of an interface name
    pub const MAX_IFACE_NAME_LEN: usize = 15;
}
