//! Framed WebSocket transport to the Gateway.
//!
//! Wraps a `tokio-tungstenite` stream and speaks the binary tunnel codec
//! (see `tunnel_protocol::codec`) over it. This is the agent-side half of
//! the framed transport; the gateway has its own `GatewaySocket` built on
//! `axum::extract::ws` rather than sharing a trait with this type.

use anyhow::{anyhow, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::protocol::Message as WsMessage, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, warn};
use tunnel_protocol::{codec, Message};

use crate::config::AgentConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct AgentSocket {
    ws: WsStream,
}

impl AgentSocket {
    /// Open the WebSocket connection to the Gateway's tunnel endpoint.
    ///
    /// The api key travels both as a pre-upgrade `X-Api-Key`
    /// header (checked by the gateway before the WebSocket handshake even
    /// completes) and again inside the first `Auth` protocol message.
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        let url = &config.gateway.url;
        info!(url = %url, "connecting to gateway");

        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build websocket upgrade request")?;
        request.headers_mut().insert(
            "X-Api-Key",
            config
                .gateway
                .api_key
                .parse()
                .context("api key is not a valid header value")?,
        );

        let connector = build_tls_connector(config)?;
        let (ws, response) = connect_async_tls_with_config(request, None, false, Some(connector))
            .await
            .context("failed to connect to gateway")?;

        debug!(status = %response.status(), "websocket connection established");
        Ok(Self { ws })
    }

    /// Send one already-framed message.
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message).context("failed to encode outbound message")?;
        self.ws
            .send(WsMessage::Binary(bytes))
            .await
            .context("failed to write to websocket")
    }

    /// Receive and decode the next message, transparently answering pings
    /// and ignoring control frames that carry no payload.
    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let message = codec::decode(&data).context("failed to decode frame")?;
                    return Ok(Some(message));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("ignoring unexpected text frame from gateway");
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    self.ws.send(WsMessage::Pong(payload)).await?;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    info!("gateway closed the connection");
                    return Ok(None);
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
                None => return Ok(None),
            }
        }
    }

    /// Split into independently ownable reader/writer halves so a
    /// receive loop parked on an idle socket never blocks a concurrent
    /// send, the way a shared `Mutex<AgentSocket>` would. Mirrors the
    /// teacher's own `ws_stream.split()` at connection setup.
    pub fn into_split(self) -> (AgentSocketReader, AgentSocketWriter) {
        let (sink, stream) = self.ws.split();
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        (
            AgentSocketReader { stream, ping_tx },
            AgentSocketWriter { sink, ping_rx },
        )
    }
}

/// Owns the read half after [`AgentSocket::into_split`]. Inbound `Ping`
/// frames are handed off to the writer half over an unbounded channel
/// rather than answered in place, since the writer alone holds the sink.
pub struct AgentSocketReader {
    stream: SplitStream<WsStream>,
    ping_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AgentSocketReader {
    pub async fn recv_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let message = codec::decode(&data).context("failed to decode frame")?;
                    return Ok(Some(message));
                }
                Some(Ok(WsMessage::Text(_))) => {
                    warn!("ignoring unexpected text frame from gateway");
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = self.ping_tx.send(payload);
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => {
                    info!("gateway closed the connection");
                    return Ok(None);
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
                None => return Ok(None),
            }
        }
    }
}

/// Owns the write half after [`AgentSocket::into_split`]. `recv_pong`
/// drains pings the reader observed so the owning send loop can answer
/// them on the same sink it already writes application frames to.
pub struct AgentSocketWriter {
    sink: SplitSink<WsStream, WsMessage>,
    ping_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl AgentSocketWriter {
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let bytes = codec::encode(message).context("failed to encode outbound message")?;
        self.sink
            .send(WsMessage::Binary(bytes))
            .await
            .context("failed to write to websocket")
    }

    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .send(WsMessage::Pong(payload))
            .await
            .context("failed to write pong to websocket")
    }

    pub async fn recv_ping(&mut self) -> Option<Vec<u8>> {
        self.ping_rx.recv().await
    }
}

fn build_tls_connector(config: &AgentConfig) -> Result<tokio_tungstenite::Connector> {
    use native_tls::TlsConnector;

    let mut builder = TlsConnector::builder();

    if let Some(ca_file) = &config.tls.ca_file {
        let ca_pem = std::fs::read(ca_file)
            .with_context(|| format!("failed to read CA certificate: {}", ca_file))?;
        let ca_cert =
            native_tls::Certificate::from_pem(&ca_pem).context("failed to parse CA certificate")?;
        builder.add_root_certificate(ca_cert);
    }

    if !config.tls.verify_server {
        warn!("gateway TLS verification disabled - not recommended for production");
        builder.danger_accept_invalid_certs(true);
    }

    let connector = builder.build().context("failed to build TLS connector")?;
    Ok(tokio_tungstenite::Connector::NativeTls(connector))
}
