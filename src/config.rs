use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    client::ClientConfig,
    tracker::{FAILURE_BACKOFF, POLL_INTERVAL, TrackerConfig},
    wichmann_hill::DEFAULT_MAX_SEARCH_STEPS,
    window::DEFAULT_WINDOW_DEPTH,
};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Settings persisted between runs. Unknown keys are ignored and missing keys
/// take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_file_path: PathBuf,
    pub saved_ip: String,
    pub average_count: usize,
    pub udp_logging: bool,
    pub poll_interval_ms: u64,
    pub failure_backoff_ms: u64,
    pub max_search_steps: u64,
    pub read_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file_path: PathBuf::from("logs/"),
            saved_ip: "192.168.".to_string(),
            average_count: DEFAULT_WINDOW_DEPTH,
            udp_logging: false,
            poll_interval_ms: millis(POLL_INTERVAL),
            failure_backoff_ms: millis(FAILURE_BACKOFF),
            max_search_steps: DEFAULT_MAX_SEARCH_STEPS,
            read_timeout_ms: millis(crate::protocol::READ_TIMEOUT),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(io::Error::from).map_err(write_err)?;
        fs::write(path, json + "\n").map_err(write_err)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            ..ClientConfig::default()
        }
    }
}

impl From<&Config> for TrackerConfig {
    fn from(config: &Config) -> Self {
        Self {
            window_depth: config.average_count,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
            max_search_steps: config.max_search_steps,
            log_dir: Some(config.log_file_path.clone()),
            ..TrackerConfig::default()
        }
    }
}
