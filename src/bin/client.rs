//! # Upload Client
//!
//! Reference client for the image protocol, mostly for checking a server
//! deployment and reproducing student client behaviour.
//!
//! ```bash
//! cargo run --bin client -- --server 127.0.0.1:2240 --homework-id ABCDEF123 photo.bmp
//! cargo run --bin client -- --homework-id ABCDEF123 --chunk-delay-ms 5000 photo.bmp
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use lab_image_ingest::common::frame::{encode_frame, write_frame};
use lab_image_ingest::common::identifier::validate;
use lab_image_ingest::common::logging::init_logger;

/// Bytes sent before pausing when `--chunk-delay-ms` is set.
const FIRST_CHUNK: usize = 50;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:2240")]
    server: String,

    /// Nine-character homework id, e.g. ABCDEF123
    #[arg(long)]
    homework_id: String,

    /// Image file to upload
    image: PathBuf,

    /// Send the first 50 bytes, wait this long, then send the rest
    #[arg(long)]
    chunk_delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let id = validate(&args.homework_id)?;
    let image = std::fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    let mut stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("Connected to {}, sending {} bytes for {}", args.server, image.len(), id);

    match args.chunk_delay_ms {
        Some(delay) => {
            let data = encode_frame(id.as_str().as_bytes(), &image)?;
            let split = FIRST_CHUNK.min(data.len());
            stream.write_all(&data[..split]).await?;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            stream.write_all(&data[split..]).await?;
            stream.flush().await?;
        }
        None => write_frame(&mut stream, id.as_str().as_bytes(), &image).await?,
    }

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    println!("Received {}", String::from_utf8_lossy(&response));

    Ok(())
}
