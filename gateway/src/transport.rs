//! Framed transport over an already-upgraded `axum` WebSocket.
//!
//! This is the gateway-side half of the framed transport; unlike the
//! agent's `AgentSocket` it is built on `axum::extract::ws::WebSocket`
//! rather than `tokio-tungstenite` directly, since axum owns the upgrade.

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use tunnel_protocol::{codec, Message};

pub struct GatewaySocket {
    ws: WebSocket,
}

impl GatewaySocket {
    pub fn new(ws: WebSocket) -> Self {
        Self { ws }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message).context("failed to encode outbound message")?;
        self.ws
            .send(WsMessage::Binary(bytes))
            .await
            .context("failed to write to websocket")
    }

    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let message = codec::decode(&data).context("failed to decode frame")?;
                    return Ok(Some(message));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("ignoring unexpected text frame from agent");
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    info!("agent closed the connection");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
                None => {
                    debug!("websocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    /// Split into independently ownable reader/writer halves so a receive
    /// loop parked on an idle socket never blocks a concurrent send, the
    /// way a shared `Mutex<GatewaySocket>` would. Mirrors the teacher's own
    /// `socket.split()` in `agent_server`/`backend_client`.
    pub fn into_split(self) -> (GatewaySocketReader, GatewaySocketWriter) {
        let (sink, stream) = self.ws.split();
        (GatewaySocketReader { stream }, GatewaySocketWriter { sink })
    }
}

pub struct GatewaySocketReader {
    stream: SplitStream<WebSocket>,
}

impl GatewaySocketReader {
    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let message = codec::decode(&data).context("failed to decode frame")?;
                    return Ok(Some(message));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("ignoring unexpected text frame from agent");
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    info!("agent closed the connection");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
                None => {
                    debug!("websocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

pub struct GatewaySocketWriter {
    sink: SplitSink<WebSocket, WsMessage>,
}

impl GatewaySocketWriter {
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message).context("failed to encode outbound message")?;
        self.sink
            .send(WsMessage::Binary(bytes))
            .await
            .context("failed to write to websocket")
    }
}
