//! Osport Runtime Configuration
//!
//! Handles parsing and management of osport.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching osport.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OsportConfig {
    /// Worker pool for blocking calls
    #[serde(default)]
    pub workers: WorkerConfig,

    /// I/O driver
    #[serde(default)]
    pub driver: DriverConfig,

    /// Directory watchers
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl OsportConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: OsportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("osport.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers.max_threads == 0 {
            return Err(ConfigError::Invalid("workers.max_threads must be > 0".into()));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers.queue_capacity must be > 0".into(),
            ));
        }
        if self.driver.max_events == 0 {
            return Err(ConfigError::Invalid("driver.max_events must be > 0".into()));
        }
        if self.driver.lane_threads == 0 {
            return Err(ConfigError::Invalid("driver.lane_threads must be > 0".into()));
        }
        if self.driver.device_threads == 0 {
            return Err(ConfigError::Invalid("driver.device_threads must be > 0".into()));
        }
        if self.driver.device_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "driver.device_timeout_ms must be > 0; zero never expires".into(),
            ));
        }
        // inotify refuses reads smaller than one maximal record
        let min_buffer = 16 + 255 + 1;
        if self.watcher.buffer_size < min_buffer {
            return Err(ConfigError::Invalid(format!(
                "watcher.buffer_size must be >= {}",
                min_buffer
            )));
        }
        Ok(())
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Upper bound on worker threads
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Work items that may wait for a free worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_threads() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// I/O driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    /// Readiness events fetched per epoll wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Threads executing positional file transfers
    #[serde(default = "default_lane_threads")]
    pub lane_threads: usize,

    /// Threads executing USB bulk transfers
    #[serde(default = "default_device_threads")]
    pub device_threads: usize,

    /// Milliseconds one bulk transfer waits before checking for close
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u32,
}

fn default_max_events() -> usize {
    256
}

fn default_lane_threads() -> usize {
    8
}

fn default_device_threads() -> usize {
    4
}

fn default_device_timeout_ms() -> u32 {
    500
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            lane_threads: default_lane_threads(),
            device_threads: default_device_threads(),
            device_timeout_ms: default_device_timeout_ms(),
        }
    }
}

/// Directory watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    /// Bytes of change records read per completion
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    64 * 1024
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
