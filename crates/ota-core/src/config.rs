//! Client configuration.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::protocol::{
    CLIENT_DOWNLOAD_PORT, MAX_BLOCK_DATA_SIZE, MAX_RETRIES, SERVER_CONTROL_PORT,
};

/// Identity and limits for one OTA client node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Manufacturer code baked into this node's firmware.
    pub manufacturer_code: u16,
    /// Image type this node accepts.
    pub image_type: u16,
    /// Version of the firmware currently running.
    pub current_file_version: u32,
    /// Hardware revision reported in image queries.
    pub hardware_version: u16,

    /// Local port for the bulk block-transfer socket.
    pub download_port: u16,
    /// Control port update servers listen on.
    pub server_control_port: u16,
    /// Address server discovery probes are sent to.
    pub discovery_addr: SocketAddr,

    /// Consecutive failed exchanges tolerated before aborting.
    pub max_retries: u16,
    /// Largest data payload requested per block exchange.
    pub max_block_size: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manufacturer_code: 0x1037,
            image_type: 0x0001,
            current_file_version: 1,
            hardware_version: 0x0101,
            download_port: CLIENT_DOWNLOAD_PORT,
            server_control_port: SERVER_CONTROL_PORT,
            discovery_addr: SocketAddr::new("ff03::1".parse().unwrap(), SERVER_CONTROL_PORT),
            max_retries: MAX_RETRIES,
            max_block_size: MAX_BLOCK_DATA_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
