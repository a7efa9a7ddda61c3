//! Application settings

use crate::core::correlator::{SingleFlight, WaitMode};
use crate::core::logger::LogFormat;
use crate::core::session::SessionConfig;
use crate::core::transport::BluetoothConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load/save failure
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File read/write failed
    #[error("Config I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Session behaviour
    pub session: SessionSettings,
    /// Bluetooth transport
    pub bluetooth: BluetoothConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Path of the default config file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load config from `path`, or defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Heartbeat key override (resolver default when unset)
    pub heartbeat_key: Option<String>,
    /// `fixed` or `until_response`
    pub wait_mode: WaitMode,
    /// `queue` or `fail_fast`
    pub single_flight: SingleFlight,
    /// Default send-and-wait window in milliseconds
    pub default_wait_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_key: None,
            wait_mode: WaitMode::Fixed,
            single_flight: SingleFlight::Queue,
            default_wait_ms: 200,
        }
    }
}

impl SessionSettings {
    /// Session configuration for these settings
    pub fn to_session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_wait_mode(self.wait_mode)
            .with_single_flight(self.single_flight)
            .with_default_wait(Duration::from_millis(self.default_wait_ms));
        if let Some(key) = &self.heartbeat_key {
            config = config.with_heartbeat_key(key.clone());
        }
        config
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (`error`, `warn`, `info`, `debug`, `trace`)
    pub level: String,
    /// Directory for the rolling log file
    pub log_dir: Option<PathBuf>,
    /// Record raw traffic next to the log file
    pub traffic: bool,
    /// Traffic log format
    pub traffic_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            traffic: false,
            traffic_format: LogFormat::Hex,
        }
    }
}
