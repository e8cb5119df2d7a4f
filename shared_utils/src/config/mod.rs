//! Configuration management module for TunnelKeeper.
//!
//! This module provides functionality for loading, parsing, and managing
//! the daemon's configuration: where tunnel configurations and persisted
//! state live, which tools the backend drives, and logging settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::tunnel::DEFAULT_WORKERS;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Where tunnel configurations and manager state are kept.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding one `<name>.conf` per tunnel
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// JSON file with last-used tunnel, restore flag and running set
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tunnelkeeper"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_config_dir() -> PathBuf {
    data_dir().join("configs")
}

fn default_state_file() -> PathBuf {
    data_dir().join("state.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            config_dir: default_config_dir(),
            state_file: default_state_file(),
        }
    }
}

/// Command-line tools driven by the default backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// `wg-quick` executable (default: "wg-quick")
    #[serde(default = "default_wg_quick")]
    pub wg_quick: String,

    /// `wg` executable (default: "wg")
    #[serde(default = "default_wg")]
    pub wg: String,

    /// Directory where configurations are staged for `wg-quick`
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,
}

fn default_wg_quick() -> String {
    "wg-quick".to_string()
}

fn default_wg() -> String {
    "wg".to_string()
}

fn default_runtime_dir() -> String {
    "/run/tunnelkeeper".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            wg_quick: default_wg_quick(),
            wg: default_wg(),
            runtime_dir: default_runtime_dir(),
        }
    }
}

/// Main configuration structure for TunnelKeeper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily-rotated log files into this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backend tooling
    #[serde(default)]
    pub backend: BackendConfig,

    /// Collaborator calls allowed in flight (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            json_logs: false,
            log_dir: None,
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            workers: default_workers(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.config_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingValue("storage.config_dir".to_string()));
        }
        if self.storage.state_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingValue("storage.state_file".to_string()));
        }
        for (key, value) in [
            ("backend.wg_quick", &self.backend.wg_quick),
            ("backend.wg", &self.backend.wg),
            ("backend.runtime_dir", &self.backend.runtime_dir),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingValue(key.to_string()));
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "workers".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                message: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        Ok(())
    }

    /// Apply environment variable overrides (prefix: TUNNELKEEPER_)
    /// Example keys:
    /// - TUNNELKEEPER_LOG_LEVEL, TUNNELKEEPER_JSON_LOGS, TUNNELKEEPER_LOG_DIR, TUNNELKEEPER_WORKERS
    /// - TUNNELKEEPER_STORAGE_CONFIG_DIR, TUNNELKEEPER_STORAGE_STATE_FILE
    /// - TUNNELKEEPER_BACKEND_WG_QUICK, TUNNELKEEPER_BACKEND_WG, TUNNELKEEPER_BACKEND_RUNTIME_DIR
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Ok(v) = env::var("TUNNELKEEPER_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = env::var("TUNNELKEEPER_JSON_LOGS") {
            if let Some(b) = parse_bool(&v) {
                cfg.json_logs = b;
            }
        }
        if let Ok(v) = env::var("TUNNELKEEPER_LOG_DIR") {
            cfg.log_dir = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Ok(v) = env::var("TUNNELKEEPER_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.workers = n;
            }
        }

        // Storage
        if let Ok(v) = env::var("TUNNELKEEPER_STORAGE_CONFIG_DIR") {
            cfg.storage.config_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("TUNNELKEEPER_STORAGE_STATE_FILE") {
            cfg.storage.state_file = PathBuf::from(v);
        }

        // Backend
        if let Ok(v) = env::var("TUNNELKEEPER_BACKEND_WG_QUICK") {
            cfg.backend.wg_quick = v;
        }
        if let Ok(v) = env::var("TUNNELKEEPER_BACKEND_WG") {
            cfg.backend.wg = v;
        }
        if let Ok(v) = env::var("TUNNELKEEPER_BACKEND_RUNTIME_DIR") {
            cfg.backend.runtime_dir = v;
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tunnelkeeper").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
