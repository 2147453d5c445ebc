//! # Image Server Entry Point
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin server -- --config config/ingest.toml
//! cargo run --bin server -- --port 2240 --storage-root photos --delay-ms 2000
//! ```
//!
//! Exits non-zero if the config is invalid, the storage root is not a
//! writable directory, or the port cannot be bound. Otherwise runs forever.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use lab_image_ingest::common::config::load_config;
use lab_image_ingest::common::logging::init_logger;
use lab_image_ingest::server::config::IngestConfig;
use lab_image_ingest::server::IngestServer;

/// Command-line arguments for the server binary. Flags override the file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the server configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, on all interfaces
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding one slot per homework id (must already exist)
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Maximum number of simultaneous uploads
    #[arg(long)]
    max_connections: Option<usize>,

    /// Pause before storing each image, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Reject payloads that are not BMP images
    #[arg(long)]
    require_bmp: bool,
}

impl Args {
    fn into_config(self) -> Result<IngestConfig> {
        let mut config: IngestConfig = match &self.config {
            Some(path) => load_config(path)?,
            None => IngestConfig::default(),
        };

        if let Some(port) = self.port {
            config.server.address = format!("0.0.0.0:{}", port);
        }
        if let Some(root) = self.storage_root {
            config.storage.root = root;
        }
        if let Some(max) = self.max_connections {
            config.server.max_connections = max;
        }
        if let Some(delay) = self.delay_ms {
            config.protocol.processing_delay_ms = delay;
        }
        if self.require_bmp {
            config.protocol.require_bmp = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    let config = Args::parse().into_config()?;
    let server = IngestServer::bind(&config).await?;

    server.run().await;

    Ok(())
}
