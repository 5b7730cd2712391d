//! The Gateway's self-update signal protocol.
//!
//! The Gateway never updates itself in-process. `UpdateCoordinator`
//! validates an `UpdateRequest`, writes a small JSON signal file that an
//! external supervisor (systemd unit, container orchestrator) watches
//! for, and reports back whether the request was accepted. Actually
//! restarting the process is entirely outside this crate's job.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tunnel_protocol::{version, UpdateStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSignal {
    target_version: String,
    current_version: String,
    requested_by: String,
    requested_at: chrono::DateTime<Utc>,
}

pub struct UpdateCoordinator {
    allow_remote_update: bool,
    signal_path: PathBuf,
    current_version: String,
    queued: Mutex<bool>,
}

pub struct UpdateOutcome {
    pub accepted: bool,
    pub error: Option<String>,
    pub status: UpdateStatus,
}

impl UpdateCoordinator {
    pub fn new(allow_remote_update: bool, signal_path: PathBuf, current_version: String) -> Self {
        Self {
            allow_remote_update,
            signal_path,
            current_version,
            queued: Mutex::new(false),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Handle an `UpdateRequest`. Rejected outright when remote
    /// updates are disabled; a request for a version that's already
    /// queued resolves as `Accepted=true, status=AlreadyQueued` rather
    /// than an error, since the outcome the caller cares about (an
    /// update will happen) is already satisfied.
    pub async fn request_update(&self, target_version: &str, requested_by: &str) -> UpdateOutcome {
        if !self.allow_remote_update {
            warn!(requested_by, "rejected remote update request: disabled by configuration");
            return UpdateOutcome {
                accepted: false,
                error: Some("remote update is disabled on this gateway".to_string()),
                status: UpdateStatus::Rejected,
            };
        }

        if !version::is_greater(target_version, &self.current_version) {
            warn!(
                target_version,
                current_version = %self.current_version,
                "rejected update request: target is not newer than current version"
            );
            return UpdateOutcome {
                accepted: false,
                error: Some("target version is not newer than the current version".to_string()),
                status: UpdateStatus::Rejected,
            };
        }

        let mut queued = self.queued.lock().await;
        if *queued {
            info!(target_version, requested_by, "update already queued, treating as accepted");
            return UpdateOutcome {
                accepted: true,
                error: None,
                status: UpdateStatus::AlreadyQueued,
            };
        }

        let signal = UpdateSignal {
            target_version: target_version.to_string(),
            current_version: self.current_version.clone(),
            requested_by: requested_by.to_string(),
            requested_at: Utc::now(),
        };

        if let Err(e) = self.write_signal(&signal).await {
            warn!(error = %e, "failed to write update signal file");
            return UpdateOutcome {
                accepted: false,
                error: Some(format!("failed to queue update: {e}")),
                status: UpdateStatus::Rejected,
            };
        }

        *queued = true;
        info!(target_version, requested_by, path = %self.signal_path.display(), "queued self-update");
        UpdateOutcome {
            accepted: true,
            error: None,
            status: UpdateStatus::Queued,
        }
    }

    async fn write_signal(&self, signal: &UpdateSignal) -> anyhow::Result<()> {
        if let Some(parent) = self.signal_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(signal)?;
        tokio::fs::write(&self.signal_path, json).await?;
        Ok(())
    }

    pub async fn is_queued(&self) -> bool {
        *self.queued.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_remote_update_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = UpdateCoordinator::new(false, dir.path().join("update.json"), "1.2.0".to_string());
        let outcome = coordinator.request_update("1.3.0", "agent-cli").await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.status, UpdateStatus::Rejected);
    }

    #[tokio::test]
    async fn queues_and_writes_signal_file() {
        let dir = tempfile::tempdir().unwrap();
        let signal_path = dir.path().join("update.json");
        let coordinator = UpdateCoordinator::new(true, signal_path.clone(), "1.2.0".to_string());

        let outcome = coordinator.request_update("1.3.0", "agent-cli").await;
        assert!(outcome.accepted);
        assert_eq!(outcome.status, UpdateStatus::Queued);
        assert!(signal_path.exists());
    }

    #[tokio::test]
    async fn second_request_is_already_queued() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = UpdateCoordinator::new(true, dir.path().join("update.json"), "1.2.0".to_string());

        let first = coordinator.request_update("1.3.0", "agent-cli").await;
        assert_eq!(first.status, UpdateStatus::Queued);

        let second = coordinator.request_update("1.3.0", "agent-cli").await;
        assert!(second.accepted);
        assert_eq!(second.status, UpdateStatus::AlreadyQueued);
    }

    #[tokio::test]
    async fn rejects_target_not_newer_than_current() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = UpdateCoordinator::new(true, dir.path().join("update.json"), "1.2.0".to_string());
        let outcome = coordinator.request_update("1.2.0", "agent-cli").await;
        assert!(!outcome.accepted);
        assert_eq!(outcome.status, UpdateStatus::Rejected);
        assert!(!coordinator.is_queued().await);
    }
}
