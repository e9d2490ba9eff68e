use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

// Protocol constants
pub const CHUNK_SIZE: usize = 8 * 1024; // fixed, last chunk may be shorter
pub const CHUNK_PACING: Duration = Duration::from_millis(10);
pub const DEFAULT_LISTEN_PORT: u16 = 4000;

// Discovery constants
pub const DISCOVERY_PORT: u16 = 57143;
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub transfer: TransferConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name announced to peers over the wire and in discovery datagrams.
    pub name: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub output_directory: String,
    pub enable_progress_bar: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub broadcast_interval_ms: u64,
}

impl Config {
    pub fn load_or_create(path: &Path) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Created default config file at {:?}", path);
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.discovery.broadcast_interval_ms)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.device.name.trim().is_empty() {
            return Err(TransferError::ConfigError(
                "device name must not be empty".to_string(),
            ));
        }
        if self.device.name.contains('|') {
            return Err(TransferError::ConfigError(
                "device name must not contain '|'".to_string(),
            ));
        }
        if self.discovery.broadcast_interval_ms == 0 {
            return Err(TransferError::ConfigError(
                "broadcast interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "lanbeam-device".to_string());
        Config {
            device: DeviceConfig {
                name: hostname,
                listen_port: DEFAULT_LISTEN_PORT,
            },
            transfer: TransferConfig {
                output_directory: "./received_files".to_string(),
                enable_progress_bar: true,
            },
            discovery: DiscoveryConfig {
                broadcast_interval_ms: BROADCAST_INTERVAL.as_millis() as u64,
            },
        }
    }
}
