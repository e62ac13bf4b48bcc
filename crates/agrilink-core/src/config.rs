//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the backend endpoint, the public anon key, where sessions
//! are persisted, and the last used email.
//!
//! Configuration is stored at `~/.config/agrilink/config.json`. Environment
//! variables override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "agrilink";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Auth service default minimum password length
const DEFAULT_MIN_SECRET_LENGTH: usize = 6;

/// How often the session manager checks whether the token needs refreshing
const DEFAULT_AUTO_REFRESH_SECS: u64 = 60;

/// State change notifications buffered per subscriber
const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

const ENV_BACKEND_URL: &str = "AGRILINK_BACKEND_URL";
const ENV_ANON_KEY: &str = "AGRILINK_ANON_KEY";
const ENV_SESSION_STORAGE: &str = "AGRILINK_SESSION_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStorageKind {
    /// Encrypted file in the data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

impl std::str::FromStr for SessionStorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(SessionStorageKind::File),
            "keyring" | "keychain" => Ok(SessionStorageKind::Keyring),
            other => Err(anyhow!("Unknown session storage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub anon_key: String,
    pub session_storage: SessionStorageKind,
    pub min_secret_length: usize,
    pub auto_refresh_secs: u64,
    pub event_buffer_size: usize,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            anon_key: String::new(),
            session_storage: SessionStorageKind::default(),
            min_secret_length: DEFAULT_MIN_SECRET_LENGTH,
            auto_refresh_secs: DEFAULT_AUTO_REFRESH_SECS,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `AGRILINK_*` environment variables on top of the file values
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.backend_url = url;
        }
        if let Some(key) = lookup(ENV_ANON_KEY) {
            self.anon_key = key;
        }
        if let Some(kind) = lookup(ENV_SESSION_STORAGE) {
            self.session_storage = kind.parse()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() {
            return Err(anyhow!(
                "Backend URL is not configured (set {} or backend_url in {})",
                ENV_BACKEND_URL,
                CONFIG_FILE
            ));
        }
        if !(self.backend_url.starts_with("https://") || self.backend_url.starts_with("http://")) {
            return Err(anyhow!("Backend URL must be http(s): {}", self.backend_url));
        }
        if self.anon_key.trim().is_empty() {
            return Err(anyhow!(
                "Anon key is not configured (set {} or anon_key in {})",
                ENV_ANON_KEY,
                CONFIG_FILE
            ));
        }
        Ok(())
    }

    pub fn auto_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.auto_refresh_secs.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
