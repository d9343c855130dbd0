//! Configuration system for Motionbus.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MOTIONBUS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/motionbus/config.toml
//!   3. ~/.config/motionbus/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::BUFFER_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionbusConfig {
    pub bus: BusConfig,
    pub transport: TransportConfig,
    pub channels: ChannelConfig,
    pub files: FilesConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// spidev character device the firmware is attached to.
    pub spi_device: PathBuf,
    pub spi_speed_hz: u32,
    /// GPIO number of the transfer-ready line (sysfs numbering).
    pub transfer_ready_pin: u32,
    /// Ready-line timeout until the first transfer has succeeded.
    pub first_connect_timeout_ms: u64,
    /// Ready-line timeout once connected.
    pub transfer_timeout_ms: u64,
    /// Ready-line timeout while streaming a firmware image.
    pub iap_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Attempts per exchange phase before a full transfer is abandoned.
    pub max_retries: u32,
    /// Transmit buffers kept for resends. Must be at least 2.
    pub tx_buffer_count: usize,
    /// Size of each transmit buffer and of the receive buffer.
    pub buffer_size: usize,
    /// Pause between full transfers.
    pub poll_delay_ms: u64,
    /// Tolerate newer firmware protocol versions so an update can be pushed.
    pub update_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Bytes of serialized codes that may be in flight per channel.
    pub max_buffer_space_per_channel: usize,
    /// Macro codes read ahead and started before their predecessors finish.
    pub buffered_macro_codes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Directory that stands in for the firmware's virtual SD card.
    pub base_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP port. 0 disables the API.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            spi_device: PathBuf::from("/dev/spidev0.0"),
            spi_speed_hz: 8_000_000,
            transfer_ready_pin: 25,
            first_connect_timeout_ms: 2500,
            transfer_timeout_ms: 500,
            iap_timeout_ms: 8000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            tx_buffer_count: 3,
            buffer_size: BUFFER_SIZE,
            poll_delay_ms: 25,
            update_only: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_buffer_space_per_channel: 1536,
            buffered_macro_codes: 16,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("/opt/motionbus/sd"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

impl BusConfig {
    pub fn first_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.first_connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn iap_timeout(&self) -> Duration {
        Duration::from_millis(self.iap_timeout_ms)
    }
}

impl TransportConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("motionbus")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn parse_flag(v: &str) -> bool {
    v == "true" || v == "1"
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MotionbusConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MotionbusConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MOTIONBUS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MotionbusConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the transport cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.tx_buffer_count < 2 {
            return Err(ConfigError::Invalid(
                "transport.tx_buffer_count",
                format!("{} (need at least 2 for resends)", self.transport.tx_buffer_count),
            ));
        }
        if self.transport.buffer_size == 0 || self.transport.buffer_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(
                "transport.buffer_size",
                self.transport.buffer_size.to_string(),
            ));
        }
        if self.transport.max_retries == 0 {
            return Err(ConfigError::Invalid("transport.max_retries", "0".into()));
        }
        if self.channels.buffered_macro_codes == 0 {
            return Err(ConfigError::Invalid("channels.buffered_macro_codes", "0".into()));
        }
        Ok(())
    }

    /// Apply MOTIONBUS_* overrides. `lookup` is the environment in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MOTIONBUS_BUS__SPI_DEVICE") {
            self.bus.spi_device = PathBuf::from(v);
        }
        if let Some(v) = lookup("MOTIONBUS_BUS__TRANSFER_READY_PIN") {
            if let Ok(p) = v.parse() {
                self.bus.transfer_ready_pin = p;
            }
        }
        if let Some(v) = lookup("MOTIONBUS_TRANSPORT__UPDATE_ONLY") {
            self.transport.update_only = parse_flag(&v);
        }
        if let Some(v) = lookup("MOTIONBUS_FILES__BASE_DIRECTORY") {
            self.files.base_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("MOTIONBUS_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
