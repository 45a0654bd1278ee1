//! Runtime configuration for the flow engine.
//!
//! This is the deployment side of the engine (where data lives, how the
//! sensor is reached, loop timing). User-facing flow settings live in
//! [`crate::settings`].

use crate::sensor::{DEFAULT_ADDRESS, SENSOR_REGISTER};
use crate::store::{BASELINE_FILE, LOG_FILE, SETTINGS_FILE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding settings, usage log and baselines
    pub data_path: PathBuf,

    /// How the flow controller is reached
    pub sensor: SensorConfig,

    /// Interval between pulse-rate reads
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Interval between checks of the valve-change queue
    #[serde(with = "duration_millis")]
    pub drain_interval: Duration,

    /// Readings averaged for the displayed flow rate
    pub smoother_size: usize,

    /// Port for the HTTP status server
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sip-flow");

        Self {
            data_path: data_dir,
            sensor: SensorConfig::default(),
            poll_interval: Duration::from_secs(1),
            drain_interval: Duration::from_millis(250),
            smoother_size: crate::core::smoother::DEFAULT_SMOOTHER_SIZE,
            http_port: 8089,
        }
    }
}

impl Config {
    /// Configuration rooted at `data_path`, everything else default.
    pub fn with_data_path(data_path: PathBuf) -> Self {
        Self {
            data_path,
            ..Self::default()
        }
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sip-flow")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_path.join(SETTINGS_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_path.join(LOG_FILE)
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.data_path.join(BASELINE_FILE)
    }
}

/// Address of the flow controller on the I2C bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub address: u8,
    pub register: u8,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            register: SENSOR_REGISTER,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
