// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const APP_DIR: &str = "open-car-key";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Data directory for the vehicle registry and associations.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Location this config was loaded from.
    #[serde(skip)]
    pub path: PathBuf,

    /// Bluetooth settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name, e.g. "hci0". The default adapter is used when unset.
    pub adapter: Option<String>,

    /// How long pairing discovery collects candidates.
    pub discovery_timeout_secs: u64,

    /// Interval between presence checks for associated vehicles.
    pub presence_poll_secs: u64,

    /// Only offer devices whose advertised name starts with this.
    pub name_prefix: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            discovery_timeout_secs: 10,
            presence_poll_secs: 5,
            name_prefix: None,
        }
    }
}

impl BluetoothConfig {
    /// Zero intervals are raised to one second.
    fn clamp_intervals(&mut self) {
        if self.presence_poll_secs == 0 {
            warn!("presence_poll_secs must be at least 1, using 1");
            self.presence_poll_secs = 1;
        }
        if self.discovery_timeout_secs == 0 {
            warn!("discovery_timeout_secs must be at least 1, using 1");
            self.discovery_timeout_secs = 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    /// Send the auto-lock request after the link becomes ready.
    pub auto_lock_enabled: bool,
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self::load_from(&config_dir.join("config.toml"), data_dir)
    }

    /// Load from an explicit path, writing defaults if the file is absent.
    pub fn load_from(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut config: Config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(config_path, content)?;
            info!("Wrote default configuration to {:?}", config_path);
            config
        };

        config.path = config_path.to_path_buf();
        config.data_dir = data_dir;
        config.bluetooth.clamp_intervals();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Save configuration to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Persisted preferences the session consults at runtime.
pub trait Preferences: Send + Sync {
    fn auto_lock_enabled(&self) -> bool;
}

impl Preferences for AtomicBool {
    fn auto_lock_enabled(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Config shared between the session and the foreground UI.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Toggle the auto-lock preference and persist it.
    pub fn set_auto_lock_enabled(&self, enabled: bool) -> Result<()> {
        let mut config = self.inner.write();
        config.session.auto_lock_enabled = enabled;
        config.save()?;
        info!("Auto-lock {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }
}

impl Preferences for SharedConfig {
    fn auto_lock_enabled(&self) -> bool {
        self.inner.read().session.auto_lock_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_writes_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("cfg").join("config.toml");
        let config = Config::load_from(&path, temp_dir.path().join("data"))?;

        assert!(path.exists());
        assert!(temp_dir.path().join("data").exists());
        assert!(!config.session.auto_lock_enabled);
        assert_eq!(config.bluetooth.discovery_timeout_secs, 10);
        assert_eq!(config.bluetooth.presence_poll_secs, 5);

        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nauto_lock_enabled = true\n")?;

        let config = Config::load_from(&path, temp_dir.path().join("data"))?;
        assert!(config.session.auto_lock_enabled);
        assert_eq!(config.bluetooth.adapter, None);
        assert_eq!(config.bluetooth.presence_poll_secs, 5);

        Ok(())
    }

    #[test]
    fn test_zero_intervals_are_clamped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[bluetooth]\npresence_poll_secs = 0\ndiscovery_timeout_secs = 0\n",
        )?;

        let config = Config::load_from(&path, temp_dir.path().join("data"))?;
        assert_eq!(config.bluetooth.presence_poll_secs, 1);
        assert_eq!(config.bluetooth.discovery_timeout_secs, 1);

        Ok(())
    }

    #[test]
    fn test_auto_lock_toggle_persists() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");
        let shared = SharedConfig::new(Config::load_from(&path, temp_dir.path().join("data"))?);

        assert!(!shared.auto_lock_enabled());
        shared.set_auto_lock_enabled(true)?;
        assert!(shared.auto_lock_enabled());
        assert!(shared.snapshot().session.auto_lock_enabled);

        let reloaded = Config::load_from(&path, temp_dir.path().join("data"))?;
        assert!(reloaded.session.auto_lock_enabled);

        Ok(())
    }
}
