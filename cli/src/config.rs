// Configuration management for the eter CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/eter/config.json
// - Linux: ~/.config/eter/config.json
// - Windows: %APPDATA%\eter\config.json

use anyhow::{Context, Result};
use eter_mesh_core::channel::validate_channel_name;
use eter_mesh_core::{DeliveryPolicy, MeshConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "eter";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display name on public channels
    pub alias: Option<String>,

    /// Channel joined by `eter start`
    pub default_channel: String,

    /// Address `eter relay` and `eter signal` listen on
    pub listen_addr: String,

    /// Everything the mesh node itself needs
    pub mesh: MeshConfig,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alias: None,
            default_channel: "general".to_string(),
            listen_addr: "0.0.0.0:8765".to_string(),
            mesh: MeshConfig::default(),
            path: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join(APP_DIR);

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join(APP_DIR);

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Where the identity secret lives
    pub fn identity_file() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("identity.json"))
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the platform location, creating a default one if missing
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_file()?)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            Config::default()
        };
        config.path = Some(path.to_path_buf());

        if !path.exists() {
            config.save()?;
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => Self::config_file()?,
        };
        self.mesh.validate().context("Refusing to save invalid config")?;

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn add_relay(&mut self, url: String) -> Result<bool> {
        if self.mesh.relays.contains(&url) {
            return Ok(false);
        }
        self.mesh.relays.push(url);
        if let Err(e) = self.save() {
            self.mesh.relays.pop();
            return Err(e);
        }
        Ok(true)
    }

    pub fn remove_relay(&mut self, url: &str) -> Result<bool> {
        let before = self.mesh.relays.len();
        self.mesh.relays.retain(|r| r != url);
        if self.mesh.relays.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "alias" => next.alias = non_empty(value),
            "default_channel" => {
                validate_channel_name(value.trim())?;
                next.default_channel = value.trim().to_string();
            }
            "listen_addr" => next.listen_addr = value.to_string(),
            "signaling_url" => next.mesh.signaling_url = non_empty(value),
            "platform" => next.mesh.platform = value.to_string(),
            "delivery_policy" => {
                next.mesh.delivery_policy = value.parse::<DeliveryPolicy>()?;
            }
            "staleness_window_ms" => next.mesh.staleness_window_ms = parse_ms(value)?,
            "heartbeat_interval_ms" => next.mesh.heartbeat_interval_ms = parse_ms(value)?,
            "self_test_timeout_ms" => next.mesh.self_test_timeout_ms = parse_ms(value)?,
            "connect_timeout_ms" => next.mesh.connect_timeout_ms = parse_ms(value)?,
            "reconnect_base_ms" => next.mesh.reconnect_base_ms = parse_ms(value)?,
            "reconnect_max_ms" => next.mesh.reconnect_max_ms = parse_ms(value)?,
            "stun_servers" => {
                next.mesh.stun_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.save()?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let mesh = &self.mesh;
        vec![
            ("alias".to_string(), self.alias.clone().unwrap_or_else(|| "(short peer id)".to_string())),
            ("default_channel".to_string(), self.default_channel.clone()),
            ("listen_addr".to_string(), self.listen_addr.clone()),
            ("signaling_url".to_string(), mesh.signaling_url.clone().unwrap_or_else(|| "(none)".to_string())),
            ("platform".to_string(), mesh.platform.clone()),
            ("delivery_policy".to_string(), policy_name(mesh.delivery_policy).to_string()),
            ("staleness_window_ms".to_string(), mesh.staleness_window_ms.to_string()),
            ("heartbeat_interval_ms".to_string(), mesh.heartbeat_interval_ms.to_string()),
            ("self_test_timeout_ms".to_string(), mesh.self_test_timeout_ms.to_string()),
            ("connect_timeout_ms".to_string(), mesh.connect_timeout_ms.to_string()),
            ("reconnect_base_ms".to_string(), mesh.reconnect_base_ms.to_string()),
            ("reconnect_max_ms".to_string(), mesh.reconnect_max_ms.to_string()),
            ("stun_servers".to_string(), mesh.stun_servers.join(",")),
            ("relays".to_string(), mesh.relays.len().to_string()),
        ]
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_ms(value: &str) -> Result<u64> {
    value.parse().context("Expected a number of milliseconds")
}

fn policy_name(policy: DeliveryPolicy) -> &'static str {
    match policy {
        DeliveryPolicy::DirectAndRelay => "direct_and_relay",
        DeliveryPolicy::DirectPreferred => "direct_preferred",
        DeliveryPolicy::RelayOnly => "relay_only",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_channel, "general");
        assert!(config.mesh.relays.is_empty());
        assert_eq!(config.mesh.staleness_window_ms, 15_000);
    }

    #[test]
    fn test_load_creates_file_and_persists_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        config.set("alias", "alice").unwrap();
        config.set("delivery_policy", "relay").unwrap();
        assert!(config.add_relay("ws://127.0.0.1:8765".to_string()).unwrap());
        assert!(!config.add_relay("ws://127.0.0.1:8765".to_string()).unwrap());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.alias.as_deref(), Some("alice"));
        assert_eq!(reloaded.mesh.delivery_policy, DeliveryPolicy::RelayOnly);
        assert_eq!(reloaded.mesh.relays, vec!["ws://127.0.0.1:8765".to_string()]);
        assert_eq!(reloaded.get("delivery_policy").as_deref(), Some("relay_only"));
    }

    #[test]
    fn test_invalid_values_leave_config_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::load_from(&path).unwrap();

        assert!(config.set("signaling_url", "http://nope").is_err());
        assert!(config.mesh.signaling_url.is_none());

        assert!(config.set("heartbeat_interval_ms", "60000").is_err());
        assert_eq!(config.mesh.heartbeat_interval_ms, 1_000);

        assert!(config.add_relay("not a url".to_string()).is_err());
        assert!(config.mesh.relays.is_empty());

        assert!(config.set("default_channel", "a/b").is_err());
        assert_eq!(config.default_channel, "general");

        assert!(config.set("no_such_key", "1").is_err());
        assert!(config.get("no_such_key").is_none());
    }

    #[test]
    fn test_remove_relay() {
        let dir = tempdir().unwrap();
        let mut config = Config::load_from(dir.path().join("config.json")).unwrap();
        config.add_relay("ws://a.example:1".to_string()).unwrap();
        assert!(config.remove_relay("ws://a.example:1").unwrap());
        assert!(!config.remove_relay("ws://a.example:1").unwrap());
    }
}
