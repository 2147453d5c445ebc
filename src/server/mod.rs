//! # Ingestion Server
//!
//! - [`server`]: listener and dispatcher with the concurrency bound
//! - [`connection`]: per-connection upload state machine
//! - [`storage`]: atomic latest-wins image slots
//! - [`config`]: TOML configuration
//! - [`metrics`]: upload counters

pub mod config;
pub mod connection;
pub mod metrics;
pub mod server;
pub mod storage;

pub use config::IngestConfig;
pub use metrics::IngestStats;
pub use server::IngestServer;
pub use storage::Storage;
