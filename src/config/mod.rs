//! Configuration management for ClipLink
//!
//! This module handles loading, validating, and managing configuration
//! for the ClipLink sync service.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stable device identifier (generated if not specified)
    #[serde(default = "generate_device_id")]
    pub device_id: String,

    /// Human-readable device name shown to peers
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Network address the socket transport listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Pairing and session configuration
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Sync behavior configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Content filter configuration
    #[serde(default)]
    pub filter: FilterConfig,

    /// Clipboard hub (history) configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Pairing and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Seconds a generated PIN stays valid
    #[serde(default = "default_pin_ttl_secs")]
    pub pin_ttl_secs: u64,

    /// Seconds a session token stays valid
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Seconds between expired-session sweeps
    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,
}

/// Sync behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Default MTU for the constrained link when the platform stack does
    /// not supply a negotiated value
    #[serde(default = "default_mtu")]
    pub default_mtu: usize,

    /// Milliseconds within which an identical fingerprint is treated as a
    /// duplicate or echo
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Minimum milliseconds between accepted syncs per device
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,

    /// Seconds a partial reassembly may sit without progress before it is
    /// discarded
    #[serde(default = "default_reassembly_staleness_secs")]
    pub reassembly_staleness_secs: u64,

    /// Milliseconds between parallel chunk batches on the constrained link
    #[serde(default = "default_chunk_batch_delay_ms")]
    pub chunk_batch_delay_ms: u64,

    /// Chunks sent concurrently per batch on the constrained link
    #[serde(default = "default_chunk_batch_size")]
    pub chunk_batch_size: usize,
}

/// Content filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum content size in bytes accepted for sync
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,

    /// Keywords that block a sync when contained in the content
    #[serde(default = "default_blocked_keywords")]
    pub blocked_keywords: Vec<String>,
}

/// Clipboard hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Number of entries kept in the hub before FIFO eviction
    #[serde(default = "default_hub_capacity")]
    pub capacity: usize,
}

// Default value functions
fn generate_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_device_name() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    format!("{}-cliplink", hostname)
}

fn default_listen_addr() -> String {
    "0.0.0.0:8484".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pin_ttl_secs() -> u64 {
    300
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_sweep_secs() -> u64 {
    5 * 60
}

fn default_mtu() -> usize {
    512
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_rate_limit_ms() -> u64 {
    100
}

fn default_reassembly_staleness_secs() -> u64 {
    30
}

fn default_chunk_batch_delay_ms() -> u64 {
    20
}

fn default_chunk_batch_size() -> usize {
    4
}

fn default_max_content_size() -> usize {
    10_000
}

fn default_blocked_keywords() -> Vec<String> {
    vec![
        "password".to_string(),
        "passwd".to_string(),
        "secret".to_string(),
        "api_key".to_string(),
    ]
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("default config must deserialize")
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            pin_ttl_secs: default_pin_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            session_sweep_secs: default_session_sweep_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_mtu: default_mtu(),
            debounce_ms: default_debounce_ms(),
            rate_limit_ms: default_rate_limit_ms(),
            reassembly_staleness_secs: default_reassembly_staleness_secs(),
            chunk_batch_delay_ms: default_chunk_batch_delay_ms(),
            chunk_batch_size: default_chunk_batch_size(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_content_size: default_max_content_size(),
            blocked_keywords: default_blocked_keywords(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: default_hub_capacity(),
        }
    }
}

fn default_hub_capacity() -> usize {
    100
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location, falling back to
    /// defaults when the file does not exist
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Default config file location (`~/.config/cliplink/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("cliplink").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::Validation("device_id must not be empty".into()));
        }
        if self.sync.default_mtu < codec_min_mtu() {
            return Err(ConfigError::Validation(format!(
                "default_mtu {} is below the minimum usable MTU {}",
                self.sync.default_mtu,
                codec_min_mtu()
            )));
        }
        if self.filter.max_content_size == 0 || self.filter.max_content_size > crate::MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_content_size must be between 1 and {}",
                crate::MAX_PAYLOAD_SIZE
            )));
        }
        if self.hub.capacity == 0 {
            return Err(ConfigError::Validation("hub capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn codec_min_mtu() -> usize {
    crate::codec::MIN_MTU
}
