use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Config shared between the controller and the dispatcher.
pub type SharedConfig = Arc<RwLock<Config>>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Proxy side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    /// Point the OS proxy settings at the listener while it runs.
    pub auto_proxy: bool,
    pub save_log_file: bool,
    /// Substring an HTTP record's host must contain; empty passes all.
    pub filter_host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            auto_proxy: true,
            save_log_file: false,
            filter_host: String::new(),
        }
    }
}

/// Link-layer capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device: String,
    /// Max bytes kept per frame.
    pub snaplen: i32,
    pub promisc: bool,
    pub timeout_ms: i32,
    /// BPF filter expression, e.g. `tcp and port 80`.
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            snaplen: 1024,
            promisc: true,
            timeout_ms: 1000,
            filter: "tcp and port 80".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub ip: CaptureConfig,
    pub queue_capacity: usize,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            ip: CaptureConfig::default(),
            queue_capacity: 1000,
            log_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&s)?)
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("using default config: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(path, s).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
