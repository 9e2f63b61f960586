//! Configuration system for the storage peer daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PPD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ppd/config.toml
//!   3. ~/.config/ppd/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::message::SpInfo;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PpConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub version: VersionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This node's p2p address. Sent in every SP request.
    pub p2p_address: String,
    /// Hex public key matching `p2p_address`.
    pub p2p_public_key: String,
    /// Wallet that owns this node.
    pub wallet_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the node accepts peer connections on. Empty = don't listen.
    pub listen_address: String,
    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bootstrap supervising peers. Replaced at runtime by SP list reloads.
    pub sp_list: Vec<SpInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Budget for every correlation wait (one chunk, one ack, one answer).
    pub rpc_wait_timeout_secs: u64,
    /// How often the SP list is re-queried.
    pub sp_list_reload_secs: u64,
    /// How often every SP is probed for latency.
    pub latency_check_secs: u64,
    /// How often this node asks the SP for its own status.
    pub pp_status_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Stamped into every frame header.
    pub app_ver: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:18081".to_string(),
            connect_timeout_ms: 3_000,
            sp_list: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            rpc_wait_timeout_secs: 30,
            sp_list_reload_secs: 60 * 60,
            latency_check_secs: 60,
            pp_status_secs: 5 * 60,
        }
    }
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self { app_ver: 1 }
    }
}

impl TimingConfig {
    pub fn rpc_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_wait_timeout_secs)
    }

    pub fn sp_list_reload(&self) -> Duration {
        Duration::from_secs(self.sp_list_reload_secs)
    }

    pub fn latency_check(&self) -> Duration {
        Duration::from_secs(self.latency_check_secs)
    }

    pub fn pp_status(&self) -> Duration {
        Duration::from_secs(self.pp_status_secs)
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ppd")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PpConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            PpConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PPD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PpConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PPD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PPD_IDENTITY__P2P_ADDRESS") {
            self.identity.p2p_address = v;
        }
        if let Ok(v) = std::env::var("PPD_IDENTITY__WALLET_ADDRESS") {
            self.identity.wallet_address = v;
        }
        if let Ok(v) = std::env::var("PPD_NETWORK__LISTEN_ADDRESS") {
            self.network.listen_address = v;
        }
        // Comma-separated network addresses; identities are learned on reload.
        if let Ok(v) = std::env::var("PPD_NETWORK__SP_LIST") {
            self.network.sp_list = parse_sp_addresses(&v);
        }
        if let Ok(v) = std::env::var("PPD_TIMING__RPC_WAIT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.timing.rpc_wait_timeout_secs = secs;
            }
        }
    }
}

fn parse_sp_addresses(list: &str) -> Vec<SpInfo> {
    list.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|addr| SpInfo {
            p2p_address: String::new(),
            p2p_public_key: String::new(),
            network_address: addr.to_string(),
        })
        .collect()
}
