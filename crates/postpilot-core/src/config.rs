//! PostPilot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PostPilotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostPilotConfig {
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

impl PostPilotConfig {
    /// Load config from the default path (~/.postpilot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PostPilotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PostPilotError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PostPilotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the PostPilot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".postpilot")
    }

    /// Resolve the data directory (where the sqlite databases live).
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::home_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }
}

/// Poller loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Seconds between due-task passes.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Seconds between credential expiry sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Max tasks dispatched concurrently per pass.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Cooldown before a task that failed recoverably is retried.
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_secs: u64,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    3600
}
fn default_max_concurrent() -> usize {
    4
}
fn default_retry_cooldown() -> u64 {
    300
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            sweep_interval_secs: default_sweep_interval(),
            max_concurrent: default_max_concurrent(),
            retry_cooldown_secs: default_retry_cooldown(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for sqlite files. Empty = ~/.postpilot.
    #[serde(default)]
    pub data_dir: String,
}

/// Credential manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Encrypt token material at rest.
    #[serde(default = "bool_true")]
    pub encrypt: bool,
    /// Refresh tokens this many days before they expire.
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_days: i64,
}

fn bool_true() -> bool {
    true
}
fn default_refresh_margin() -> i64 {
    3
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            encrypt: bool_true(),
            refresh_margin_days: default_refresh_margin(),
        }
    }
}

/// Per-platform application credentials (the app's own OAuth identity,
/// not user tokens — those live in the credential store).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub facebook: AppKeyPair,
    #[serde(default)]
    pub instagram: AppKeyPair,
    #[serde(default)]
    pub linkedin: AppKeyPair,
    #[serde(default)]
    pub twitter: AppKeyPair,
}

/// OAuth client id/secret pair for one platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppKeyPair {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl AppKeyPair {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}
