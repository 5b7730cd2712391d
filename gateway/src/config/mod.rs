//! Gateway configuration module

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub gateway: GatewaySettings,
    pub edge_proxy: EdgeProxySettings,
    pub update: UpdateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_public_base_domain")]
    pub public_base_domain: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8443
}

fn default_api_key() -> String {
    String::new()
}

fn default_public_base_domain() -> String {
    "octoporty.local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeProxySettings {
    #[serde(default = "default_caddy_admin_url")]
    pub caddy_admin_url: String,
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,
}

fn default_caddy_admin_url() -> String {
    "http://127.0.0.1:2019".to_string()
}

fn default_reconcile_timeout_secs() -> u64 {
    10
}

impl Default for EdgeProxySettings {
    fn default() -> Self {
        Self {
            caddy_admin_url: default_caddy_admin_url(),
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default)]
    pub allow_remote_update: bool,
    #[serde(default = "default_signal_path")]
    pub signal_path: PathBuf,
}

fn default_signal_path() -> PathBuf {
    PathBuf::from("/var/lib/octoporty/update.signal")
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            allow_remote_update: false,
            signal_path: default_signal_path(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings {
                id: "gateway-1".to_string(),
                listen_addr: default_listen_addr(),
                listen_port: default_listen_port(),
                api_key: String::new(),
                public_base_domain: default_public_base_domain(),
            },
            edge_proxy: EdgeProxySettings::default(),
            update: UpdateSettings::default(),
        }
    }
}

/// Load configuration from file, applying environment overrides named per
/// the `Gateway__*` convention (double underscore denotes hierarchy).
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content).context("failed to parse config file")?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        GatewayConfig::default()
    };

    if let Ok(key) = std::env::var("Gateway__ApiKey") {
        config.gateway.api_key = key;
    }
    if let Ok(url) = std::env::var("Gateway__CaddyAdminUrl") {
        config.edge_proxy.caddy_admin_url = url;
    }
    if let Ok(port) = std::env::var("Gateway__ListenPort") {
        if let Ok(port) = port.parse() {
            config.gateway.listen_port = port;
        }
    }
    if let Ok(allow) = std::env::var("Gateway__AllowRemoteUpdate") {
        config.update.allow_remote_update = allow.eq_ignore_ascii_case("true") || allow == "1";
    }
    if let Ok(path) = std::env::var("Gateway__UpdateSignalPath") {
        config.update.signal_path = PathBuf::from(path);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway.listen_port, 8443);
        assert!(!config.update.allow_remote_update);
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
gateway:
  id: gw-east-1
  api_key: topsecret

edge_proxy: {}

update:
  allow_remote_update: true
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.id, "gw-east-1");
        assert!(config.update.allow_remote_update);
        assert_eq!(config.edge_proxy.caddy_admin_url, "http://127.0.0.1:2019");
    }
}
