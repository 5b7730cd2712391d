//! Where the agent gets its port mappings and landing page from.
//!
//! The persistent mapping store this would eventually read from is out of
//! scope here; `YamlConfigSource` is the file-backed stand-in described in
//! the design notes, polling the mapping file's mtime so the driver can
//! still react to edits without a restart.

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use md5::Digest;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, warn};
use tunnel_protocol::PortMapping;

/// Source of truth for the mappings and landing page an agent publishes
/// to the Gateway via `ConfigSync`.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn list_enabled_mappings(&self) -> Result<Vec<PortMapping>>;
    /// The landing page HTML and the lowercase-hex MD5 hash of its UTF-8
    /// bytes.
    async fn landing_page(&self) -> Result<Option<(String, String)>>;
    /// A receiver that ticks whenever the underlying source may have
    /// changed; the driver treats every tick as "go resync".
    fn subscribe(&self) -> watch::Receiver<()>;
}

#[derive(Debug, Deserialize)]
struct MappingsFile {
    #[serde(default)]
    mappings: Vec<PortMapping>,
}

pub struct YamlConfigSource {
    file_path: PathBuf,
    landing_page_path: Option<PathBuf>,
    change_tx: watch::Sender<()>,
    change_rx: watch::Receiver<()>,
}

impl YamlConfigSource {
    pub fn new(file_path: PathBuf, landing_page_path: Option<PathBuf>) -> Self {
        let (change_tx, change_rx) = watch::channel(());
        Self {
            file_path,
            landing_page_path,
            change_tx,
            change_rx,
        }
    }

    /// Spawn the mtime-polling task that drives `subscribe()`.
    pub fn spawn_watcher(self: &std::sync::Arc<Self>, poll_interval: std::time::Duration) {
        let source = self.clone();
        tokio::spawn(async move {
            let mut last_modified: Option<SystemTime> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let modified = tokio::fs::metadata(&source.file_path)
                    .await
                    .and_then(|m| m.modified())
                    .ok();

                if modified.is_some() && modified != last_modified {
                    last_modified = modified;
                    if source.change_tx.send(()).is_err() {
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ConfigSource for YamlConfigSource {
    async fn list_enabled_mappings(&self) -> Result<Vec<PortMapping>> {
        if !self.file_path.exists() {
            warn!(path = %self.file_path.display(), "mappings file not found, publishing empty set");
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.file_path)
            .await
            .with_context(|| format!("failed to read mappings file: {}", self.file_path.display()))?;

        let parsed: MappingsFile =
            serde_yaml::from_str(&content).context("failed to parse mappings file")?;

        let mut mappings: Vec<PortMapping> = parsed.mappings.into_iter().filter(|m| m.enabled).collect();
        mappings.sort_by_key(|m| m.id);
        Ok(mappings)
    }

    async fn landing_page(&self) -> Result<Option<(String, String)>> {
        let Some(path) = &self.landing_page_path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        match tokio::fs::read_to_string(path).await {
            Ok(html) => {
                let digest = md5::Md5::digest(html.as_bytes());
                let hash = digest.iter().map(|b| format!("{:02x}", b)).collect();
                Ok(Some((html, hash)))
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read landing page");
                Ok(None)
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.change_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use uuid::Uuid;

    #[tokio::test]
    async fn filters_disabled_mappings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "mappings:\n  - id: {}\n    external_domain: a.test\n    internal_host: 127.0.0.1\n    internal_port: 80\n    internal_use_tls: false\n    allow_self_signed: false\n    enabled: true\n    description: \"\"\n  - id: {}\n    external_domain: b.test\n    internal_host: 127.0.0.1\n    internal_port: 81\n    internal_use_tls: false\n    allow_self_signed: false\n    enabled: false\n    description: \"\"\n",
            Uuid::new_v4(),
            Uuid::new_v4(),
        )
        .unwrap();

        let source = YamlConfigSource::new(file.path().to_path_buf(), None);
        let mappings = source.list_enabled_mappings().await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].external_domain, "a.test");
    }

    #[tokio::test]
    async fn missing_file_yields_empty_set() {
        let source = YamlConfigSource::new(PathBuf::from("/nonexistent/path.yaml"), None);
        let mappings = source.list_enabled_mappings().await.unwrap();
        assert!(mappings.is_empty());
    }
}
