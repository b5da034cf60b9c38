// Configuration File Support
//
// Host settings for running a node: logging, where the node's configuration
// store lives, the radio address the node answers to, and firmware update
// limits. TOML format with environment variable overrides.
//
// Mesh settings (Wi-Fi, broker, peers, keys) are not here. They live in the
// node's configuration store and are changed with commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mesh::peers::PeerAddress;
use crate::node::OtaSettings;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "garden-node.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Node runtime configuration
    pub node: NodeConfig,

    /// Firmware update limits
    pub ota: OtaConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Node runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Radio hardware address of this node
    pub address: String,

    /// Directory holding the configuration store
    pub store_path: PathBuf,

    /// Radio notifications buffered before new ones are dropped
    pub radio_queue_depth: usize,

    /// Seconds between telemetry readings on client nodes
    pub telemetry_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "02:00:00:00:00:01".to_string(),
            store_path: PathBuf::from("./garden-store"),
            radio_queue_depth: 32,
            telemetry_interval_secs: 10,
        }
    }
}

/// Firmware update configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// Images declared at or below this size are refused
    pub min_firmware_size: u64,

    /// Seconds allowed for joining the download network
    pub connect_timeout_secs: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        let defaults = OtaSettings::default();
        Self {
            min_firmware_size: defaults.min_firmware_size,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the config file does not exist, returns the
    /// default configuration with environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;

            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - GARDEN_LOG_LEVEL
    /// - GARDEN_LOG_FORMAT
    /// - GARDEN_STORE_PATH
    /// - GARDEN_NODE_ADDRESS
    /// - GARDEN_TELEMETRY_SECS
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("GARDEN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("GARDEN_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(path) = lookup("GARDEN_STORE_PATH").filter(|p| !p.is_empty()) {
            self.node.store_path = PathBuf::from(path);
        }
        if let Some(address) = lookup("GARDEN_NODE_ADDRESS") {
            if PeerAddress::parse(&address).is_ok() {
                self.node.address = address;
            }
        }
        if let Some(secs) = lookup("GARDEN_TELEMETRY_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    self.node.telemetry_interval_secs = secs;
                }
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.node_address()?;

        if self.node.radio_queue_depth == 0 {
            anyhow::bail!("Radio queue depth must be > 0");
        }
        if self.node.telemetry_interval_secs == 0 {
            anyhow::bail!("Telemetry interval must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// The node's radio address
    pub fn node_address(&self) -> Result<PeerAddress> {
        PeerAddress::parse(&self.node.address)
            .with_context(|| format!("Invalid node address: {}", self.node.address))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.node.telemetry_interval_secs)
    }

    pub fn ota_settings(&self) -> OtaSettings {
        OtaSettings {
            min_firmware_size: self.ota.min_firmware_size,
            connect_timeout: Duration::from_secs(self.ota.connect_timeout_secs),
        }
    }
}
