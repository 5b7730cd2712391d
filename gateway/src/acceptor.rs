//! Accepts the Agent's WebSocket upgrade, authenticates it, and
//! installs it as the singleton active [`TunnelSession`].
//!
//! Everything gateway-wide that a tunnel message can trigger —
//! reconciling edge-proxy routes, queuing a self-update, paging the log
//! ring — is handled here rather than inside `TunnelSession` itself,
//! which only owns the wire-level send/receive loops.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{Message, PortMapping};

use crate::session::{SessionManager, TunnelSession};
use crate::transport::GatewaySocket;
use crate::GatewayState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Constant-time comparison of the caller-supplied key against the
/// configured one. An empty configured key always refuses the upgrade
/// rather than treating "no api key configured" as "anything goes".
fn keys_match(configured: &str, supplied: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    let a = configured.as_bytes();
    let b = supplied.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

pub async fn upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let supplied = headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !keys_match(&state.config.gateway.api_key, supplied) {
        warn!("rejected tunnel upgrade: invalid or missing X-Api-Key");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        handle_tunnel(GatewaySocket::new(socket), state).await;
    })
}

async fn handle_tunnel(mut socket: GatewaySocket, state: Arc<GatewayState>) {
    let auth = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv_message()).await {
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) => {
            warn!("agent closed connection before sending Auth");
            return;
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error receiving Auth");
            return;
        }
        Err(_) => {
            warn!("timed out waiting for Auth");
            return;
        }
    };

    let (api_key, agent_version) = match auth {
        Message::Auth { api_key, agent_version } => (api_key, agent_version),
        other => {
            warn!(kind = other.kind(), "first message was not Auth");
            let _ = socket
                .send_message(&Message::AuthResult {
                    success: false,
                    error: Some("expected Auth as the first message".to_string()),
                    gateway_version: state.gateway_version.clone(),
                    landing_page_hash: None,
                })
                .await;
            return;
        }
    };

    if !keys_match(&state.config.gateway.api_key, &api_key) {
        warn!("rejected Auth: api key mismatch");
        let _ = socket
            .send_message(&Message::AuthResult {
                success: false,
                error: Some("invalid api key".to_string()),
                gateway_version: state.gateway_version.clone(),
                landing_page_hash: None,
            })
            .await;
        return;
    }

    let landing_page_hash = state.landing_page.load_full().map(|lp| lp.1.clone());
    if socket
        .send_message(&Message::AuthResult {
            success: true,
            error: None,
            gateway_version: state.gateway_version.clone(),
            landing_page_hash,
        })
        .await
        .is_err()
    {
        warn!("failed to send AuthResult");
        return;
    }

    info!(agent_version, "agent authenticated");

    let (control_tx, mut control_rx) = mpsc::channel::<Message>(64);
    let session = TunnelSession::spawn(socket, control_tx);
    session.set_agent_version(agent_version);
    state.log_layer.set_sink(Some(session.log_sink()));
    state.session_manager.replace(session.clone()).await;

    let cancel = session.cancellation_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = control_rx.recv() => {
                match received {
                    Some(message) => handle_control_message(&state, &session, message).await,
                    None => break,
                }
            }
        }
    }

    state.session_manager.clear_if(&session).await;
    state.log_layer.set_sink(None);
    info!("tunnel session ended");
}

async fn handle_control_message(state: &Arc<GatewayState>, session: &TunnelSession, message: Message) {
    match message {
        Message::ConfigSync {
            mappings,
            config_hash,
            landing_page_html,
            landing_page_hash,
        } => {
            let enabled: Vec<PortMapping> = mappings.into_iter().filter(|m| m.enabled).collect();
            session.set_mappings(enabled.clone());

            if let (Some(html), Some(hash)) = (landing_page_html, landing_page_hash) {
                state.landing_page.store(Some(Arc::new((html, hash))));
            }

            state.edge_proxy.reconcile(&enabled).await;

            session
                .enqueue(Message::ConfigAck {
                    success: true,
                    error: None,
                    config_hash,
                })
                .await;
        }
        Message::UpdateRequest { target_version, requested_by } => {
            let outcome = state.update_coordinator.request_update(&target_version, &requested_by).await;
            let accepted = outcome.accepted;
            session
                .enqueue(Message::UpdateResponse {
                    accepted: outcome.accepted,
                    error: outcome.error,
                    current_version: state.update_coordinator.current_version().to_string(),
                    status: outcome.status,
                })
                .await;

            if accepted && outcome.status == tunnel_protocol::UpdateStatus::Queued {
                session
                    .enqueue(Message::Disconnect {
                        reason: "Gateway update queued - restart imminent".to_string(),
                    })
                    .await;
            }
        }
        Message::GetLogsRequest { request_id, before_id, count } => {
            let (entries, has_more) = state.log_ring.page(before_id, count);
            session
                .enqueue(Message::GetLogsResponse {
                    request_id,
                    entries: entries.into_iter().map(Into::into).collect(),
                    has_more,
                })
                .await;
        }
        other => {
            warn!(kind = other.kind(), "unhandled control message on gateway side");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_rejects_empty_configured_key() {
        assert!(!keys_match("", ""));
        assert!(!keys_match("", "anything"));
    }

    #[test]
    fn keys_match_requires_exact_equality() {
        assert!(keys_match("secret123", "secret123"));
        assert!(!keys_match("secret123", "secret124"));
        assert!(!keys_match("secret123", "secret12"));
    }
}
