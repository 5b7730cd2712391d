//! Agent configuration module

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSettings,
    pub gateway: GatewaySettings,
    pub tls: TlsSettings,
    pub forwarder: ForwarderSettings,
    pub mappings: MappingsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_id")]
    pub id: String,
}

fn default_agent_id() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_ceiling_secs")]
    pub reconnect_ceiling_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_key() -> String {
    String::new()
}

fn default_reconnect_base_secs() -> u64 {
    1
}

fn default_reconnect_ceiling_secs() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub verify_server: bool,
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_idle_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_stream_chunk_bytes")]
    pub stream_chunk_bytes: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_pool_idle_secs() -> u64 {
    300
}

fn default_pool_max_idle() -> usize {
    100
}

fn default_stream_chunk_bytes() -> usize {
    64 * 1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_idle_timeout_secs: default_pool_idle_secs(),
            pool_max_idle_per_host: default_pool_max_idle(),
            stream_chunk_bytes: default_stream_chunk_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingsSettings {
    #[serde(default = "default_mappings_file")]
    pub file_path: PathBuf,
    pub landing_page_file: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_mappings_file() -> PathBuf {
    PathBuf::from("/etc/octoporty/mappings.yaml")
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for MappingsSettings {
    fn default() -> Self {
        Self {
            file_path: default_mappings_file(),
            landing_page_file: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSettings {
                id: "auto".to_string(),
            },
            gateway: GatewaySettings {
                url: "wss://gateway.octoporty.local:443/ws".to_string(),
                api_key: String::new(),
                reconnect_base_secs: default_reconnect_base_secs(),
                reconnect_ceiling_secs: default_reconnect_ceiling_secs(),
                heartbeat_interval_secs: default_heartbeat_interval(),
                timeout_secs: default_timeout(),
            },
            tls: TlsSettings {
                verify_server: true,
                ca_file: None,
            },
            forwarder: ForwarderSettings::default(),
            mappings: MappingsSettings::default(),
        }
    }
}

/// Load configuration from file, applying environment overrides named per
/// the `Agent__*` convention (double underscore denotes hierarchy).
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::warn!(
            path = %path.display(),
            "Config file not found, using defaults"
        );
        AgentConfig::default()
    };

    if let Ok(url) = std::env::var("Agent__GatewayUrl") {
        config.gateway.url = url;
    }
    if let Ok(key) = std::env::var("Agent__ApiKey") {
        config.gateway.api_key = key;
    }
    if let Ok(path) = std::env::var("Agent__MappingsFile") {
        config.mappings.file_path = PathBuf::from(path);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.id, "auto");
        assert!(config.tls.verify_server);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
agent:
  id: test-agent

gateway:
  url: wss://gateway.example.com:443/ws
  api_key: secret123

tls:
  verify_server: true

forwarder: {}

mappings:
  file_path: /etc/octoporty/mappings.yaml
"#;

        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agent.id, "test-agent");
        assert_eq!(config.gateway.api_key, "secret123");
        assert_eq!(config.forwarder.pool_max_idle_per_host, 100);
    }
}
