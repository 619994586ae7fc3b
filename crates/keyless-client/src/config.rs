//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relayer base URL
    pub relayer_url: String,

    /// Shared secret sent to the relayer, if it requires one
    pub relayer_secret: Option<String>,

    /// Network name forwarded to the relayer
    pub network: String,

    /// Directory holding wallet metadata and layers
    pub store_path: PathBuf,

    /// HTTP request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Reveal submissions before giving up on transient failures
    pub reveal_attempts: u32,

    /// Delay between reveal attempts (milliseconds)
    pub reveal_retry_delay_ms: u64,

    /// Time after which the contract drops an unrevealed commit (seconds)
    pub commit_timeout_secs: u64,

    /// Rebuild every recorded core when no identification key matches
    pub ident_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relayer_url: "http://127.0.0.1:3001".to_string(),
            relayer_secret: None,
            network: "harmony-mainnet".to_string(),
            store_path: Self::default_store_path(),
            request_timeout_secs: 30,
            reveal_attempts: 3,
            reveal_retry_delay_ms: 2000,
            commit_timeout_secs: 60,
            ident_fallback: true,
        }
    }
}

impl ClientConfig {
    fn default_store_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyless")
    }

    /// Platform-appropriate config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyless")
            .join("config.json")
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.store_path)?;
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.reveal_attempts == 0 {
            return Err(crate::ClientError::Config(
                "reveal_attempts must be at least 1".to_string(),
            ));
        }
        if !self.relayer_url.starts_with("http://") && !self.relayer_url.starts_with("https://") {
            return Err(crate::ClientError::Config(format!(
                "relayer_url must be http(s): {}",
                self.relayer_url
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reveal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reveal_retry_delay_ms)
    }
}

/// Helper module for platform directories
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share"))
            })
    }

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
    }
}
