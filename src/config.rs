//! Configuration module for the ping exporter.
//!
//! Loads probe targets from a YAML document and keeps the active snapshot
//! behind an atomically swapped pointer so readers never block on reload.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-target probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-packet reply deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default ICMP payload size in bytes.
pub const DEFAULT_SIZE: usize = 24;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// One probe endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Only affects the `broadcast` label, never how the host is probed.
    #[serde(default)]
    pub broadcast: bool,
}

/// A group of hosts sharing probing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_network() -> String {
    "ip".to_string()
}

fn default_protocol() -> String {
    "icmp".to_string()
}

fn default_size() -> usize {
    DEFAULT_SIZE
}

impl Default for Target {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            network: default_network(),
            protocol: default_protocol(),
            size: DEFAULT_SIZE,
        }
    }
}

/// The full set of targets at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Config {
    /// Parse a config document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Number of hosts across all targets.
    pub fn host_count(&self) -> usize {
        self.targets.iter().map(|t| t.hosts.len()).sum()
    }
}

/// Holds the active config snapshot.
///
/// `reload` builds a complete new [`Config`] before swapping it in, so a
/// reader sees either the old or the new snapshot, never a mix. A failed
/// reload leaves the current snapshot in place.
pub struct ConfigStore {
    current: ArcSwap<Config>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Create a store holding an empty config.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Config::default()),
        }
    }

    /// Load `path` and install it as the active snapshot.
    pub fn reload<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config = Config::load(path)?;
        self.current.store(Arc::new(config));
        Ok(())
    }

    /// The active snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.load_full()
    }
}
