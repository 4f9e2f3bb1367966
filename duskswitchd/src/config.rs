use duskswitch_common::tuya::{BROADCAST_PORT, DEVICE_PORT, ENCRYPTED_BROADCAST_PORT};
use duskswitch_common::{tracing, DeviceDescriptor, KeyCombo, Location};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/duskswitch/config.yaml";

/// Errors raised while loading or validating the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration file {0} did not exist; a template was written there, add your devices and restart")]
    Created(PathBuf),

    #[error("no devices configured")]
    NoDevices,

    #[error("device id {0} is configured more than once")]
    DuplicateDevice(String),

    #[error("local key of device {device} must be 16 characters, got {len}")]
    InvalidKey { device: String, len: usize },

    #[error("turn_off_keys must name at least one key")]
    NoTurnOffKeys,

    #[error("location is required unless testing is enabled")]
    MissingLocation,

    #[error("latitude {0} is outside -90..=90")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} is outside -180..=180")]
    LongitudeOutOfRange(f64),

    #[error("unknown log level {0}")]
    InvalidLogLevel(String),
}

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    /// evdev key codes that must be held together to arm the turn-off
    #[serde(default)]
    pub turn_off_keys: Vec<u16>,
    /// Delay before the turn-off batch runs, in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Treat the activation time as already passed
    #[serde(default)]
    pub testing: bool,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub network: NetworkSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
}

/// Deadlines, ports and endpoints for outbound calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Deadline for each device step (find, connect, set, disconnect)
    pub device_timeout_ms: u64,
    pub sunset_timeout_ms: u64,
    pub sunset_api_url: String,
    /// UDP port of plain discovery broadcasts
    pub discovery_port: u16,
    /// UDP port of encrypted discovery broadcasts
    pub encrypted_discovery_port: u16,
    /// TCP port used for devices found by broadcast
    pub device_port: u16,
}

fn default_delay_ms() -> u64 {
    10_000
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            device_timeout_ms: 5_000,
            sunset_timeout_ms: 10_000,
            sunset_api_url: "https://api.sunrise-sunset.org/json".to_string(),
            discovery_port: BROADCAST_PORT,
            encrypted_discovery_port: ENCRYPTED_BROADCAST_PORT,
            device_port: DEVICE_PORT,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            devices: vec![DeviceDescriptor {
                id: "your-device-id".to_string(),
                key: "0123456789abcdef".to_string(),
                name: "Desk lamp".to_string(),
                address: None,
            }],
            // Ctrl+Alt+L
            turn_off_keys: vec![29, 56, 38],
            delay_ms: default_delay_ms(),
            testing: false,
            location: Some(Location {
                latitude: 51.5072,
                longitude: -0.1276,
            }),
            network: NetworkSettings::default(),
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.id.clone()));
            }
            if device.key.len() != 16 {
                return Err(ConfigError::InvalidKey {
                    device: device.id.clone(),
                    len: device.key.len(),
                });
            }
        }

        if self.turn_off_keys.is_empty() {
            return Err(ConfigError::NoTurnOffKeys);
        }

        if !self.testing {
            let location = self.location.ok_or(ConfigError::MissingLocation)?;
            if !(-90.0..=90.0).contains(&location.latitude) {
                return Err(ConfigError::LatitudeOutOfRange(location.latitude));
            }
            if !(-180.0..=180.0).contains(&location.longitude) {
                return Err(ConfigError::LongitudeOutOfRange(location.longitude));
            }
        }

        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        tracing::Level::from_str(&self.daemon.log_level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.daemon.log_level.clone()))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn turn_off_combo(&self) -> KeyCombo {
        KeyCombo::new(self.turn_off_keys.clone())
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.network.device_timeout_ms)
    }

    pub fn sunset_timeout(&self) -> Duration {
        Duration::from_millis(self.network.sunset_timeout_ms)
    }
}

/// Configuration manager for the duskswitch daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            config: DaemonConfig::default(),
        }
    }

    /// Load and validate the configuration.
    ///
    /// A missing file is replaced by a template and reported as an error,
    /// since the template's devices are placeholders.
    pub async fn load_config(&mut self) -> Result<(), ConfigError> {
        info!("Loading configuration from {}", self.config_path.display());

        if !self.config_path.exists() {
            warn!("Configuration file not found, writing a template");
            self.config = DaemonConfig::default();
            self.save_config().await?;
            return Err(ConfigError::Created(self.config_path.clone()));
        }

        let content = fs::read_to_string(&self.config_path).await?;
        let config: DaemonConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        self.config = config;

        debug!(
            "Loaded configuration with {} devices",
            self.config.devices.len()
        );
        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), ConfigError> {
        info!("Saving configuration to {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(&self.config)?;
        fs::write(&self.config_path, content).await?;

        debug!("Configuration saved");
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }
}
