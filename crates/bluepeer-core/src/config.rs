//! Configuration for bluepeer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLUEPEER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bluepeer/config.toml
//!   3. ~/.config/bluepeer/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Channel identifier the local listener advertises when none is configured.
pub const DEFAULT_SERVICE_UUID: &str = "11111111111111111111111111111123";
pub const DEFAULT_SERVICE_NAME: &str = "1M5";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BluepeerConfig {
    pub identity: IdentityConfig,
    pub scheduler: SchedulerConfig,
    pub discovery: DiscoveryConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Local peer id. Empty = derived from the radio address.
    pub peer_id: String,
    /// Channel identifier of the local listener.
    pub service_uuid: String,
    /// Service name advertised in the local service record.
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Slots kept free for short periodic tasks.
    pub min_workers: usize,
    /// Max concurrent task executions.
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    /// A non-long-running task running longer than this is evicted.
    pub overlap_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Period of the discovery cycle.
    pub interval_secs: u64,
    /// Period of the radio power poll.
    pub power_poll_secs: u64,
    /// Period of the directory pull-merge with known peers.
    pub exchange_interval_secs: u64,
    /// Consecutive failures after which a peer is reported stale.
    pub stale_after_failures: u32,
    /// Open the inbound listener (and become discoverable) on awaken.
    pub advertise_on_awaken: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network update interval published once the radio is up.
    pub update_interval_secs: u64,
    /// Update interval while the network is in hyper mode.
    pub update_interval_hyper_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep known peers in `data_dir/peers.json`.
    pub persist_peers: bool,
}

/// Simulated medium used by the daemon when no radio binding is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub address: String,
    pub friendly_name: String,
    pub neighbours: Vec<SimulatedNeighbour>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedNeighbour {
    pub address: String,
    pub friendly_name: String,
    /// Peer id advertised in the neighbour's service record. Empty = none.
    pub peer_id: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            poll_interval_ms: 100,
            overlap_timeout_secs: 600,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // 5 min
            power_poll_secs: 3,
            exchange_interval_secs: 60,
            stale_after_failures: 3,
            advertise_on_awaken: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 1200, // 20 min
            update_interval_hyper_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
            persist_peers: true,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            address: "00:11:22:33:44:55".to_string(),
            friendly_name: "bluepeer".to_string(),
            neighbours: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn overlap_timeout(&self) -> Duration {
        Duration::from_secs(self.overlap_timeout_secs)
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn power_poll(&self) -> Duration {
        Duration::from_secs(self.power_poll_secs)
    }

    pub fn exchange_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_interval_secs)
    }
}

impl StorageConfig {
    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("bluepeer")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("bluepeer")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BluepeerConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(BluepeerConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLUEPEER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&BluepeerConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.max_workers == 0 {
            return Err(ConfigError::Invalid("scheduler.max_workers must be at least 1".into()));
        }
        if s.min_workers > s.max_workers {
            return Err(ConfigError::Invalid(format!(
                "scheduler.min_workers ({}) exceeds max_workers ({})",
                s.min_workers, s.max_workers
            )));
        }
        if s.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.poll_interval_ms must be non-zero".into()));
        }
        if self.discovery.power_poll_secs == 0 || self.discovery.interval_secs == 0 {
            return Err(ConfigError::Invalid("discovery intervals must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply BLUEPEER_* overrides. `lookup` resolves a variable name.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("BLUEPEER_IDENTITY__PEER_ID") {
            self.identity.peer_id = v;
        }
        if let Some(v) = lookup("BLUEPEER_IDENTITY__SERVICE_UUID") {
            self.identity.service_uuid = v;
        }
        if let Some(v) = lookup("BLUEPEER_SCHEDULER__MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.scheduler.max_workers = n;
            }
        }
        if let Some(v) = lookup("BLUEPEER_SCHEDULER__MIN_WORKERS") {
            if let Ok(n) = v.parse() {
                self.scheduler.min_workers = n;
            }
        }
        if let Some(v) = lookup("BLUEPEER_DISCOVERY__INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.discovery.interval_secs = n;
            }
        }
        if let Some(v) = lookup("BLUEPEER_DISCOVERY__EXCHANGE_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.discovery.exchange_interval_secs = n;
            }
        }
        if let Some(v) = lookup("BLUEPEER_DISCOVERY__ADVERTISE_ON_AWAKEN") {
            self.discovery.advertise_on_awaken = flag(v);
        }
        if let Some(v) = lookup("BLUEPEER_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BLUEPEER_STORAGE__PERSIST_PEERS") {
            self.storage.persist_peers = flag(v);
        }
    }
}
