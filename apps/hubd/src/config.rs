//! Daemon configuration.
//!
//! Stored as TOML at `~/.config/roomcast/hubd.toml` (override with
//! `ROOMCAST_CONFIG`). Created with a freshly minted static pairing
//! token on first run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use roomcast_identity::generate_token;

/// Hub daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubdConfig {
    /// WebSocket listen port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// HTTP port for the invite preview endpoint.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Static pairing credential new devices must present.
    #[serde(default = "generate_token")]
    pub static_token: String,

    /// Keepalive interval promised to clients, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Host baked into portable join codes. Defaults to
    /// `<hostname>:<listen_port>`.
    #[serde(default)]
    pub public_host: String,

    /// Directory for the device identity and issued tokens.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_listen_port() -> u16 {
    9470
}

fn default_http_port() -> u16 {
    9471
}

fn default_keepalive_ms() -> u64 {
    15_000
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".local").join("share").join("roomcast")
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into())
}

impl Default for HubdConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            http_port: default_http_port(),
            static_token: generate_token(),
            keepalive_interval_ms: default_keepalive_ms(),
            public_host: String::new(),
            data_dir: default_data_dir(),
        }
    }
}

impl HubdConfig {
    /// Loads configuration from disk, creating and saving a default on
    /// first run so the minted static token is stable across restarts.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: HubdConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = HubdConfig::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Saves the configuration to disk with owner-only permissions.
    pub fn save(&self) -> anyhow::Result<()> {
        let path = config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        // The file holds the pairing token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// The host clients should dial, as baked into join codes.
    pub fn public_host(&self) -> String {
        if self.public_host.is_empty() {
            format!("{}:{}", host_name(), self.listen_port)
        } else {
            self.public_host.clone()
        }
    }
}

/// Configuration file path, honoring the `ROOMCAST_CONFIG` override.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROOMCAST_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("roomcast")
        .join("hubd.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_mints_a_token() {
        let config = HubdConfig::default();
        assert_eq!(config.listen_port, 9470);
        assert_eq!(config.static_token.len(), 32);
        assert_ne!(config.static_token, HubdConfig::default().static_token);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: HubdConfig = toml::from_str("listen_port = 9000").unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.http_port, 9471);
        assert!(!config.static_token.is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let config = HubdConfig {
            public_host: "hub.example.org:9470".into(),
            ..HubdConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: HubdConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.public_host, "hub.example.org:9470");
        assert_eq!(parsed.static_token, config.static_token);
    }

    #[test]
    fn public_host_falls_back_to_hostname() {
        let config = HubdConfig::default();
        let host = config.public_host();
        assert!(host.ends_with(":9470"), "unexpected host {host}");
    }
}
