//! Configuration file loading for the spdb tools.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::store::StoreConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration file contents.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[store]` section, mirroring [`StoreConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,

    #[serde(default)]
    pub compress: bool,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,

    #[serde(default = "default_max_open_periods")]
    pub max_open_periods: usize,

    #[serde(default = "default_auto_compact")]
    pub auto_compact: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from("./spdb_data")
}

fn default_max_chunk_len() -> usize {
    64 * 1024 * 1024
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_poll_ms() -> u64 {
    25
}

fn default_max_open_periods() -> usize {
    16
}

fn default_auto_compact() -> bool {
    true
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_chunk_len: default_max_chunk_len(),
            compress: false,
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            max_open_periods: default_max_open_periods(),
            auto_compact: default_auto_compact(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Engine configuration derived from the `[store]` section.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            root: self.store.root.clone(),
            max_chunk_len: self.store.max_chunk_len,
            compress: self.store.compress,
            lock_timeout_ms: self.store.lock_timeout_ms,
            lock_poll_ms: self.store.lock_poll_ms,
            max_open_periods: self.store.max_open_periods,
            auto_compact: self.store.auto_compact,
        }
    }
}
