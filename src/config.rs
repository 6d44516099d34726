//! C9 (ambient) — persisted configuration for the bridge's pre-connect
//! settings. Layered the same way the teacher's own `ConfigManager`
//! is: a small settings struct, a JSON file on disk, and a manager
//! that knows how to load/save/validate it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The subset of `ClientState` that is meaningful to persist across
/// runs (spec §6 "Defaults": port 17000, latency 1 ms, bar_align
/// false). `sync_mode` is deliberately not persisted — every run
/// starts in `off` and the host application re-enables sync once the
/// DJ-Link engine is up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBridgeConfig {
    pub port: u16,
    pub latency_ms: i64,
    pub bar_align: bool,
}

impl Default for LinkBridgeConfig {
    fn default() -> Self {
        Self {
            port: 17000,
            latency_ms: 1,
            bar_align: false,
        }
    }
}

impl LinkBridgeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.latency_ms < 0 {
            return Err("latency_ms must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    version: String,
    settings: LinkBridgeConfig,
}

/// Loads and saves [`LinkBridgeConfig`] as JSON, defaulting to
/// `config.json` in the current working directory when no path is
/// given.
pub struct ConfigManager {
    config_path: PathBuf,
    settings: LinkBridgeConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let config_path = config_path.unwrap_or_else(|| PathBuf::from("config.json"));
        Self {
            config_path,
            settings: LinkBridgeConfig::default(),
        }
    }

    /// Load settings from disk, writing out a default file first if
    /// none exists yet.
    pub fn load(&mut self) -> Result<LinkBridgeConfig, ConfigError> {
        if !self.config_path.exists() {
            self.save()?;
            return Ok(self.settings.clone());
        }

        let content = fs::read_to_string(&self.config_path)
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        let file: ConfigFile =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if file.version != env!("CARGO_PKG_VERSION") {
            log::warn!(
                "config file version {} doesn't match crate version {}; using it as-is",
                file.version,
                env!("CARGO_PKG_VERSION")
            );
        }
        file.settings.validate().map_err(ConfigError::Invalid)?;

        self.settings = file.settings;
        Ok(self.settings.clone())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            if parent != Path::new("") {
                fs::create_dir_all(parent).map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }
        let file = ConfigFile {
            version: env!("CARGO_PKG_VERSION").to_string(),
            settings: self.settings.clone(),
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(&self.config_path, content).map_err(|e| ConfigError::Write(e.to_string()))
    }

    pub fn update_settings(&mut self, settings: LinkBridgeConfig) -> Result<(), ConfigError> {
        settings.validate().map_err(ConfigError::Invalid)?;
        self.settings = settings;
        self.save()
    }

    pub fn settings(&self) -> &LinkBridgeConfig {
        &self.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(String),
    Write(String),
    Parse(String),
    Serialize(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(msg) => write!(f, "failed to read config file: {msg}"),
            ConfigError::Write(msg) => write!(f, "failed to write config file: {msg}"),
            ConfigError::Parse(msg) => write!(f, "failed to parse config file: {msg}"),
            ConfigError::Serialize(msg) => write!(f, "failed to serialize config: {msg}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn new_manager_has_default_settings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let manager = ConfigManager::new(Some(path.clone()));
        assert_eq!(manager.config_path(), path);
        assert_eq!(manager.settings(), &LinkBridgeConfig::default());
    }

    #[test]
    fn save_then_load_round_trips_settings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        let mut manager = ConfigManager::new(Some(path.clone()));
        manager
            .update_settings(LinkBridgeConfig {
                port: 18000,
                latency_ms: 5,
                bar_align: true,
            })
            .unwrap();

        let mut manager2 = ConfigManager::new(Some(path));
        let loaded = manager2.load().unwrap();
        assert_eq!(loaded.port, 18000);
        assert_eq!(loaded.latency_ms, 5);
        assert!(loaded.bar_align);
    }

    #[test]
    fn load_with_no_file_writes_and_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let mut manager = ConfigManager::new(Some(path.clone()));
        let loaded = manager.load().unwrap();
        assert_eq!(loaded, LinkBridgeConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn negative_latency_is_rejected() {
        let mut manager = ConfigManager::new(None);
        let err = manager.update_settings(LinkBridgeConfig {
            port: 17000,
            latency_ms: -1,
            bar_align: false,
        });
        assert!(err.is_err());
    }
}
