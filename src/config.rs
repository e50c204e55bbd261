//! Configuration management for compendium.
//!
//! Configuration is loaded from `~/.config/compendium/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Model endpoint and default model.
    #[serde(default)]
    pub model: ModelConfig,
    /// Local conversation history.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Coordinator settings for `compendium serve`.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Ollama endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ollama host URL (default: http://localhost:11434).
    #[serde(default = "default_model_url")]
    pub url: String,
    /// Model name (default: qwen2.5-coder:14b).
    #[serde(default = "default_model_name")]
    pub name: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: default_model_url(),
            name: default_model_name(),
        }
    }
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model_name() -> String {
    "qwen2.5-coder:14b".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Coordinator listen address and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret. A random one is generated at startup when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// How long to wait for a worker to answer (default: 60).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    60
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("compendium"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Directory holding one history file per day.
    pub fn history_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("history"))
    }

    /// Load configuration from file, using defaults if not found.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Persist a new default model, keeping everything else on disk intact.
    pub fn update_model(name: &str) -> Result<()> {
        let mut config = Self::load()?;
        config.model.name = name.to_string();
        config.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model.url, "http://localhost:11434");
        assert!(config.history.enabled);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert!(config.server.token.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
[model]
name = "llama3.2:3b"

[history]
enabled = false

[server]
port = 4000
token = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.model.name, "llama3.2:3b");
        assert_eq!(config.model.url, "http://localhost:11434");
        assert!(!config.history.enabled);
        assert_eq!(config.server.bind_address(), "0.0.0.0:4000");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let mut config = Config::default();
        config.model.name = "custom:7b".into();
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[model\nname=").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
