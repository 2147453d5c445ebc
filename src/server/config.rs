use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::frame::FrameLimits;

/// Port assigned to the lab's image server.
pub const DEFAULT_PORT: u16 = 2240;

/// Complete ingestion server configuration.
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub server: ListenerConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
}

/// What to do with a connection accepted while every handler slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Send the busy response and close immediately.
    Reject,
    /// Stop accepting until a slot frees up.
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address to bind, e.g. "0.0.0.0:2240"
    pub address: String,
    /// Maximum number of simultaneously active handlers
    pub max_connections: usize,
    pub overload_policy: OverloadPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{}", DEFAULT_PORT),
            max_connections: 64,
            overload_policy: OverloadPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_image_bytes: usize,
    pub idle_timeout_secs: u64,
    pub max_upload_secs: u64,
    /// Reject payloads that are not BMP images
    pub require_bmp: bool,
    /// Artificial pause before storing, for exercising client timeouts
    pub processing_delay_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 1024 * 1024,
            idle_timeout_secs: 10,
            max_upload_secs: 120,
            require_bmp: false,
            processing_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one slot per homework id. Must already exist.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("photos"),
        }
    }
}

impl IngestConfig {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("server.max_connections must be at least 1");
        }
        if self.protocol.max_image_bytes == 0 {
            bail!("protocol.max_image_bytes must be at least 1");
        }
        if self.protocol.max_image_bytes > u32::MAX as usize {
            bail!(
                "protocol.max_image_bytes must fit the 4-byte length field (max {})",
                u32::MAX
            );
        }
        if self.protocol.idle_timeout_secs == 0 {
            bail!("protocol.idle_timeout_secs must be greater than 0");
        }
        if self.protocol.max_upload_secs == 0 {
            bail!("protocol.max_upload_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_image_bytes: self.protocol.max_image_bytes,
            idle_timeout: Duration::from_secs(self.protocol.idle_timeout_secs),
            max_upload: Duration::from_secs(self.protocol.max_upload_secs),
        }
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.protocol.processing_delay_ms)
    }
}
