//! The agent's connection state machine.
//!
//! `Driver::run` owns the reconnect loop: dial the Gateway, authenticate,
//! publish the current mapping set, then hand the live connection to the
//! tunnel-connection tasks and the request forwarder until it drops, at
//! which point it waits out a backoff delay and tries again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rand::thread_rng;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tunnel_protocol::{backoff, LogEntryWire, Message, PortMapping, UpdateStatus};

use crate::config::AgentConfig;
use crate::config_source::ConfigSource;
use crate::connection::TunnelConnection;
use crate::forwarder::Forwarder;
use crate::transport::AgentSocket;

/// How long the driver waits for `AuthResult`/`ConfigAck` before treating
/// the handshake as failed and falling back to reconnection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    Disconnected,
    Connecting,
    Authenticating,
    Syncing,
    Connected { since: DateTime<Utc> },
    Reconnecting { attempt: u32, retry_at: DateTime<Utc> },
}

/// Metadata captured from a successful `AuthResult`, exposed to callers
/// via [`AgentHandle`] alongside the connection state.
#[derive(Debug, Clone, Default)]
pub struct GatewayMeta {
    pub gateway_version: String,
    pub update_available: bool,
}

pub struct Driver {
    config: AgentConfig,
    config_source: Arc<dyn ConfigSource>,
    forwarder: Arc<Forwarder>,
    state_tx: watch::Sender<DriverState>,
    connection: ArcSwapOption<TunnelConnection>,
    gateway_meta: ArcSwapOption<GatewayMeta>,
}

impl Driver {
    pub fn new(config: AgentConfig, config_source: Arc<dyn ConfigSource>) -> Result<(Arc<Self>, watch::Receiver<DriverState>)> {
        let forwarder = Arc::new(Forwarder::new(config.forwarder.clone())?);
        let (state_tx, state_rx) = watch::channel(DriverState::Disconnected);

        let driver = Arc::new(Self {
            config,
            config_source,
            forwarder,
            state_tx,
            connection: ArcSwapOption::empty(),
            gateway_meta: ArcSwapOption::empty(),
        });

        Ok((driver, state_rx))
    }

    fn set_state(&self, state: DriverState) {
        let _ = self.state_tx.send(state);
    }

    /// Drive the reconnect loop forever.
    pub async fn run(self: Arc<Self>) -> ! {
        let mut attempt: u32 = 0;
        let mut resync = self.config_source.subscribe();

        loop {
            self.set_state(DriverState::Connecting);
            match self.connect_and_serve(&mut resync).await {
                Ok(()) => {
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, "tunnel connection ended");
                }
            }

            self.connection.store(None);
            self.gateway_meta.store(None);
            attempt += 1;
            let delay = backoff::next_delay(
                attempt,
                Duration::from_secs(self.config.gateway.reconnect_base_secs),
                Duration::from_secs(self.config.gateway.reconnect_ceiling_secs),
                &mut thread_rng(),
            );
            let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.set_state(DriverState::Reconnecting { attempt, retry_at });
            info!(attempt, delay_secs = delay.as_secs(), "reconnecting to gateway after delay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn current_snapshot(&self) -> Result<(Vec<PortMapping>, Option<(String, String)>)> {
        let mappings = self.config_source.list_enabled_mappings().await?;
        let landing_page = self.config_source.landing_page().await?;
        Ok((mappings, landing_page))
    }

    async fn connect_and_serve(&self, resync: &mut watch::Receiver<()>) -> Result<()> {
        self.set_state(DriverState::Connecting);
        let mut socket = AgentSocket::connect(&self.config).await?;

        self.set_state(DriverState::Authenticating);
        socket
            .send_message(&Message::Auth {
                api_key: self.config.gateway.api_key.clone(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await
            .context("failed to send Auth")?;

        let auth_result = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv_message())
            .await
            .context("timed out waiting for AuthResult")??;

        let gateway_version = match auth_result {
            Some(Message::AuthResult { success: true, gateway_version, .. }) => gateway_version,
            Some(Message::AuthResult { success: false, error, .. }) => {
                return Err(anyhow!("gateway rejected authentication: {}", error.unwrap_or_default()));
            }
            Some(other) => return Err(anyhow!("unexpected message during auth: {}", other.kind())),
            None => return Err(anyhow!("connection closed during auth")),
        };

        let update_available = gateway_is_older(env!("CARGO_PKG_VERSION"), &gateway_version);
        self.gateway_meta.store(Some(Arc::new(GatewayMeta {
            gateway_version: gateway_version.clone(),
            update_available,
        })));

        self.set_state(DriverState::Syncing);
        let (mappings, landing_page) = self.current_snapshot().await?;
        let config_hash = tunnel_protocol::config_hash(&mappings);

        socket
            .send_message(&Message::ConfigSync {
                mappings: mappings.clone(),
                config_hash: config_hash.clone(),
                landing_page_html: landing_page.as_ref().map(|(html, _)| html.clone()),
                landing_page_hash: landing_page.as_ref().map(|(_, hash)| hash.clone()),
            })
            .await
            .context("failed to send ConfigSync")?;

        // Tolerate and consume benign messages (notably `HeartbeatAck`)
        // that may arrive while waiting for the `ConfigAck` reply to
        // this handshake's `ConfigSync`.
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(anyhow!("timed out waiting for ConfigAck"));
            }
            match tokio::time::timeout(remaining, socket.recv_message()).await {
                Ok(Ok(Some(Message::ConfigAck { success: true, .. }))) => break,
                Ok(Ok(Some(Message::ConfigAck { success: false, error, .. }))) => {
                    return Err(anyhow!("gateway rejected configuration: {}", error.unwrap_or_default()));
                }
                Ok(Ok(Some(Message::Disconnect { reason }))) => {
                    return Err(anyhow!("gateway disconnected during sync: {}", reason));
                }
                Ok(Ok(Some(other))) => {
                    debug_tolerated(&other);
                    continue;
                }
                Ok(Ok(None)) => return Err(anyhow!("connection closed during sync")),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(anyhow!("timed out waiting for ConfigAck")),
            }
        }

        let heartbeat_interval = Duration::from_secs(self.config.gateway.heartbeat_interval_secs);
        let (request_tx, mut request_rx) = mpsc::channel::<Message>(64);
        let conn = TunnelConnection::spawn(socket, heartbeat_interval, request_tx);
        self.connection.store(Some(Arc::new(conn.clone())));
        self.set_state(DriverState::Connected { since: Utc::now() });
        info!(mappings = mappings.len(), config_hash = %config_hash, "tunnel established");

        let cancel = conn.cancellation_token();
        let mut current_mappings = mappings;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }
                Some(request) = request_rx.recv() => {
                    self.dispatch_request(&conn, &current_mappings, request).await;
                }
                Ok(()) = resync.changed() => {
                    if let Err(e) = self.resync_once(&conn, &mut current_mappings).await {
                        warn!(error = %e, "failed to resync configuration");
                    }
                }
            }
        }
    }

    async fn resync_once(&self, conn: &TunnelConnection, current: &mut Vec<PortMapping>) -> Result<()> {
        let (mappings, landing_page) = self.current_snapshot().await?;
        let config_hash = tunnel_protocol::config_hash(&mappings);

        let rx = conn.register_oneshot("ConfigAck".to_string());
        conn.enqueue(Message::ConfigSync {
            mappings: mappings.clone(),
            config_hash,
            landing_page_html: landing_page.as_ref().map(|(html, _)| html.clone()),
            landing_page_hash: landing_page.as_ref().map(|(_, hash)| hash.clone()),
        })
        .await;

        match rx.await {
            Ok(Message::ConfigAck { success: true, .. }) => {
                *current = mappings;
                Ok(())
            }
            Ok(Message::ConfigAck { success: false, error, .. }) => {
                Err(anyhow!("gateway rejected resync: {}", error.unwrap_or_default()))
            }
            Ok(_) | Err(_) => Err(anyhow!("no ConfigAck received for resync")),
        }
    }

    async fn dispatch_request(&self, conn: &TunnelConnection, mappings: &[PortMapping], request: Message) {
        let Message::Request { request_id, mapping_id, has_more_body, .. } = &request else {
            return;
        };

        let Some(mapping) = mappings.iter().find(|m| &m.id == mapping_id).cloned() else {
            error!(request_id = %request_id, "request references unknown mapping");
            conn.enqueue(Message::Response {
                request_id: request_id.clone(),
                status: 404,
                headers: Vec::new(),
                initial_body: Some(b"unknown mapping".to_vec()),
                has_more_body: false,
            })
            .await;
            return;
        };

        let body_chunks = if *has_more_body {
            conn.register_streaming(request_id.clone())
        } else {
            let (_, rx) = mpsc::channel(1);
            rx
        };

        let conn = conn.clone();
        let forwarder = self.forwarder.clone();
        tokio::spawn(async move {
            forwarder.forward(&conn, &mapping, request, body_chunks).await;
        });
    }
}

fn debug_tolerated(message: &Message) {
    tracing::debug!(kind = message.kind(), "tolerating message while awaiting ConfigAck");
}

/// `GatewayUpdateAvailable`: true when the agent's own version is newer
/// than the gateway's reported version.
fn gateway_is_older(agent_version: &str, gateway_version: &str) -> bool {
    tunnel_protocol::version::is_greater(agent_version, gateway_version)
}

/// Public handle used by whichever driver of an RPC-style request the
/// agent exposes internally (`ResyncConfiguration`, `RequestGatewayUpdate`,
/// `GetGatewayLogs`) to talk to the live connection without reaching into
/// `Driver`'s internals.
#[derive(Clone)]
pub struct AgentHandle {
    driver: Arc<Driver>,
}

impl AgentHandle {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    fn connection(&self) -> Result<Arc<TunnelConnection>> {
        self.driver
            .connection
            .load_full()
            .ok_or_else(|| anyhow!("not connected to gateway"))
    }

    pub fn gateway_meta(&self) -> Option<GatewayMeta> {
        self.driver.gateway_meta.load_full().map(|meta| (*meta).clone())
    }

    pub async fn resync_configuration(&self) -> Result<()> {
        let conn = self.connection()?;
        let (mappings, landing_page) = self.driver.current_snapshot().await?;
        let config_hash = tunnel_protocol::config_hash(&mappings);

        let rx = conn.register_oneshot("ConfigAck".to_string());
        conn.enqueue(Message::ConfigSync {
            mappings,
            config_hash,
            landing_page_html: landing_page.as_ref().map(|(html, _)| html.clone()),
            landing_page_hash: landing_page.as_ref().map(|(_, hash)| hash.clone()),
        })
        .await;

        match rx.await? {
            Message::ConfigAck { success: true, .. } => Ok(()),
            Message::ConfigAck { success: false, error, .. } => {
                Err(anyhow!("resync rejected: {}", error.unwrap_or_default()))
            }
            other => Err(anyhow!("unexpected reply to resync: {}", other.kind())),
        }
    }

    /// Fails if not connected, or if the gateway is not older
    /// than this agent (there is nothing to request an update to).
    pub async fn request_gateway_update(&self) -> Result<UpdateStatus> {
        let conn = self.connection()?;
        let meta = self
            .gateway_meta()
            .ok_or_else(|| anyhow!("no gateway metadata available yet"))?;
        if !meta.update_available {
            return Err(anyhow!("gateway is not older than this agent"));
        }

        let rx = conn.register_oneshot("UpdateResponse".to_string());
        conn.enqueue(Message::UpdateRequest {
            target_version: env!("CARGO_PKG_VERSION").to_string(),
            requested_by: "agent-cli".to_string(),
        })
        .await;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(Message::UpdateResponse { status, .. })) => Ok(status),
            Ok(Ok(other)) => Err(anyhow!("unexpected reply to update request: {}", other.kind())),
            Ok(Err(_)) => Err(anyhow!("connection closed while awaiting update response")),
            Err(_) => Err(anyhow!("timed out waiting for update response")),
        }
    }

    pub async fn get_gateway_logs(&self, before_id: u64, count: usize) -> Result<(Vec<LogEntryWire>, bool)> {
        let conn = self.connection()?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let rx = conn.register_oneshot(request_id.clone());
        conn.enqueue(Message::GetLogsRequest { request_id, before_id, count }).await;

        match rx.await? {
            Message::GetLogsResponse { entries, has_more, .. } => Ok((entries, has_more)),
            other => Err(anyhow!("unexpected reply to log request: {}", other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_older_detects_newer_agent() {
        assert!(gateway_is_older("1.2.0", "1.0.0"));
        assert!(!gateway_is_older("1.0.0", "1.2.0"));
        assert!(!gateway_is_older("1.0.0", "1.0.0"));
    }

    #[test]
    fn gateway_is_older_is_false_on_unparsable_versions() {
        assert!(!gateway_is_older("not-a-version", "1.0.0"));
        assert!(!gateway_is_older("1.0.0", "also-not-a-version"));
    }
}
