//! Configuration system for the crossbar simulator.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CROSSBAR_CONFIG (explicit override)
//!   2. ./crossbar.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossbarConfig {
    pub topology: TopologyConfig,
    pub timing: TimingConfig,
    pub fault: FaultConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Well-known port of the central switch.
    pub central_port: u16,
    /// Listen port of the first local switch; network N listens on
    /// base_port + N - 1.
    pub base_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Stop-and-wait retransmission timeout per in-flight item.
    pub ack_timeout_ms: u64,
    /// Retransmissions before an item is abandoned.
    pub retry_budget: u32,
    /// Central-switch delay before the first dispatch, so local switches
    /// can connect before the firewall rules flood.
    pub settle_ms: u64,
    /// Gap between the two all-finished checks of the drain debounce.
    pub drain_recheck_ms: u64,
    /// Grace period for link teardown during shutdown.
    pub shutdown_grace_ms: u64,
    /// Sleep between connection attempts.
    pub connect_retry_ms: u64,
    /// Upper bound of the random pause after each node send. 0 disables.
    pub send_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Percent chance a node transmits a checksum-corrupted copy.
    pub corrupt_percent: u8,
    /// Percent chance a node accepts data but withholds the ack.
    pub ack_drop_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for traffic scripts and per-node output logs.
    pub work_dir: PathBuf,
    /// Firewall rule file consumed by the central switch.
    pub firewall_file: PathBuf,
    /// Write an empty firewall file instead of failing when it is absent.
    pub create_missing_firewall: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            central_port: 4321,
            base_port: 1234,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 6000,
            retry_budget: 3,
            settle_ms: 3000,
            drain_recheck_ms: 1000,
            shutdown_grace_ms: 2000,
            connect_retry_ms: 50,
            send_jitter_ms: 500,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            corrupt_percent: 5,
            ack_drop_percent: 5,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            firewall_file: PathBuf::from("firewall.txt"),
            create_missing_firewall: false,
        }
    }
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CrossbarConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CrossbarConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CROSSBAR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("crossbar.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
                }
            }
            let text = toml::to_string_pretty(&CrossbarConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CROSSBAR_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CROSSBAR_TOPOLOGY__CENTRAL_PORT") {
            if let Ok(p) = v.parse() {
                self.topology.central_port = p;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_TOPOLOGY__BASE_PORT") {
            if let Ok(p) = v.parse() {
                self.topology.base_port = p;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_TIMING__ACK_TIMEOUT_MS") {
            if let Ok(t) = v.parse() {
                self.timing.ack_timeout_ms = t;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_TIMING__RETRY_BUDGET") {
            if let Ok(n) = v.parse() {
                self.timing.retry_budget = n;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_FAULT__CORRUPT_PERCENT") {
            if let Ok(p) = v.parse() {
                self.fault.corrupt_percent = p;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_FAULT__ACK_DROP_PERCENT") {
            if let Ok(p) = v.parse() {
                self.fault.ack_drop_percent = p;
            }
        }
        if let Ok(v) = std::env::var("CROSSBAR_PATHS__WORK_DIR") {
            self.paths.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CROSSBAR_PATHS__FIREWALL_FILE") {
            self.paths.firewall_file = PathBuf::from(v);
        }
    }
}
