//! The gateway-side half of a tunnel connection.
//!
//! Mirrors `agent::connection::TunnelConnection`'s queue/table shape but
//! the gateway never needs to originate its own heartbeat (the agent
//! ticks, the gateway only acks), so there are two owned tasks here
//! instead of three: receive and send.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tunnel_protocol::{Message, PortMapping};

use crate::transport::{GatewaySocket, GatewaySocketReader, GatewaySocketWriter};

struct OutboundQueue {
    items: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
        }
    }

    async fn push(&self, message: Message) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            if let Some(dropped) = items.pop_front() {
                warn!(kind = dropped.kind(), "dropping oldest queued frame, outbound queue full");
            }
        }
        items.push_back(message);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(message) = items.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }
}

const DEFAULT_OUTBOUND_CAPACITY: usize = 1000;
const STREAMING_CHANNEL_CAPACITY: usize = 100;

/// A live connection to one agent. Gateway-wide invariant (see
/// `SessionManager`) is at most one of these exists at a time.
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: OutboundQueue,
    pending_streaming: DashMap<String, mpsc::Sender<Message>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    started_at: DateTime<Utc>,
    agent_version: ArcSwapOption<String>,
    mappings: ArcSwap<Vec<PortMapping>>,
}

impl TunnelSession {
    /// Start the recv/send loops for an already-authenticated socket.
    /// `control` receives every message the owning acceptor task must
    /// react to with gateway-wide state: `ConfigSync`, `UpdateRequest`,
    /// `GetLogsRequest`, `Disconnect`.
    pub fn spawn(socket: GatewaySocket, control: mpsc::Sender<Message>) -> Self {
        let inner = Arc::new(Inner {
            outbound: OutboundQueue::new(DEFAULT_OUTBOUND_CAPACITY),
            pending_streaming: DashMap::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            started_at: Utc::now(),
            agent_version: ArcSwapOption::empty(),
            mappings: ArcSwap::from_pointee(Vec::new()),
        });

        let session = Self { inner };
        let (reader, writer) = socket.into_split();

        tokio::spawn(recv_loop(session.inner.clone(), reader, control));
        tokio::spawn(send_loop(session.inner.clone(), writer));

        session
    }

    pub async fn enqueue(&self, message: Message) {
        self.inner.outbound.push(message).await;
    }

    pub fn register_streaming(&self, request_id: String) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(STREAMING_CHANNEL_CAPACITY);
        self.inner.pending_streaming.insert(request_id, tx);
        rx
    }

    pub fn unregister_streaming(&self, request_id: &str) {
        self.inner.pending_streaming.remove(request_id);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn set_agent_version(&self, version: String) {
        self.inner.agent_version.store(Some(Arc::new(version)));
    }

    pub fn agent_version(&self) -> Option<Arc<String>> {
        self.inner.agent_version.load_full()
    }

    /// Replace the router's view of enabled mappings after a `ConfigSync`.
    pub fn set_mappings(&self, mappings: Vec<PortMapping>) {
        self.inner.mappings.store(Arc::new(mappings));
    }

    pub fn mappings(&self) -> Arc<Vec<PortMapping>> {
        self.inner.mappings.load_full()
    }

    pub fn find_mapping(&self, predicate: impl Fn(&PortMapping) -> bool) -> Option<PortMapping> {
        self.mappings().iter().find(|m| predicate(m)).cloned()
    }

    /// An adapter sink for `TunnelLogLayer`: forwards everything pushed
    /// into the returned unbounded channel onto this session's own
    /// outbound queue, until the session is disposed.
    pub fn log_sink(&self) -> mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.inner.cancel.cancelled() => return,
                    received = rx.recv() => {
                        match received {
                            Some(message) => session.enqueue(message).await,
                            None => return,
                        }
                    }
                }
            }
        });
        tx
    }

    /// Cancel the owned tasks and drop every in-flight correlation so
    /// waiting HTTP handlers see their channel close rather than hang.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.pending_streaming.clear();
    }
}

async fn recv_loop(inner: Arc<Inner>, mut reader: GatewaySocketReader, control: mpsc::Sender<Message>) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        let received = reader.recv_message().await;

        match received {
            Ok(Some(message)) => dispatch_inbound(&inner, &control, message).await,
            Ok(None) => {
                debug!("agent connection closed, ending receive loop");
                inner.cancel.cancel();
                return;
            }
            Err(e) => {
                error!(error = %e, "error receiving from agent");
                inner.cancel.cancel();
                return;
            }
        }
    }
}

async fn dispatch_inbound(inner: &Arc<Inner>, control: &mpsc::Sender<Message>, message: Message) {
    match &message {
        Message::Response { request_id, .. } | Message::ResponseBodyChunk { request_id, .. } => {
            if let Some(sender) = inner.pending_streaming.get(request_id) {
                let _ = sender.send(message).await;
            } else {
                debug!(request_id = %request_id, "response fragment for unknown or completed request");
            }
        }
        Message::Heartbeat { timestamp_ms } => {
            let uptime = (Utc::now() - inner.started_at).num_seconds().max(0) as u64;
            inner
                .outbound
                .push(Message::HeartbeatAck {
                    echoed_timestamp_ms: *timestamp_ms,
                    server_timestamp_ms: Utc::now().timestamp_millis() as u64,
                    gateway_uptime_secs: uptime,
                })
                .await;
        }
        Message::ConfigSync { .. } | Message::UpdateRequest { .. } | Message::GetLogsRequest { .. } => {
            if control.send(message).await.is_err() {
                warn!("no control receiver for inbound message, dropping");
            }
        }
        Message::Disconnect { reason } => {
            warn!(reason = %reason, "agent disconnected");
            inner.cancel.cancel();
        }
        Message::Error { code, message: text } => {
            warn!(code, message = %text, "agent reported an error");
        }
        other => {
            debug!(kind = other.kind(), "unhandled message kind on gateway side");
        }
    }
}

async fn send_loop(inner: Arc<Inner>, mut writer: GatewaySocketWriter) {
    loop {
        let message = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            message = inner.outbound.pop() => message,
        };

        if let Err(e) = writer.send_message(&message).await {
            error!(error = %e, "error sending to agent");
            inner.cancel.cancel();
            return;
        }
    }
}

/// Guards the at-most-one-active-session invariant. Only the tunnel
/// acceptor writes to this; everyone else only reads the current session.
pub struct SessionManager {
    current: tokio::sync::Mutex<Option<TunnelSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn current(&self) -> Option<TunnelSession> {
        self.current.lock().await.clone()
    }

    /// Install a new session, disposing whichever one was previously
    /// active first so its pending requests fail instead of hanging.
    pub async fn replace(&self, session: TunnelSession) {
        let mut guard = self.current.lock().await;
        if let Some(old) = guard.take() {
            old.dispose();
        }
        *guard = Some(session);
    }

    pub async fn clear_if(&self, session: &TunnelSession) {
        let mut guard = self.current.lock().await;
        if let Some(current) = guard.as_ref() {
            if current.is_disposed() {
                *guard = None;
                return;
            }
            if Arc::ptr_eq(&current.inner, &session.inner) {
                *guard = None;
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_queue_drops_oldest_when_full() {
        let queue = OutboundQueue::new(2);
        queue.push(Message::Heartbeat { timestamp_ms: 1 }).await;
        queue.push(Message::Heartbeat { timestamp_ms: 2 }).await;
        queue.push(Message::Heartbeat { timestamp_ms: 3 }).await;

        let first = queue.pop().await;
        let second = queue.pop().await;
        match (first, second) {
            (Message::Heartbeat { timestamp_ms: a }, Message::Heartbeat { timestamp_ms: b }) => {
                assert_eq!(a, 2);
                assert_eq!(b, 3);
            }
            _ => panic!("unexpected message kinds"),
        }
    }

    fn bare_session() -> TunnelSession {
        TunnelSession {
            inner: Arc::new(Inner {
                outbound: OutboundQueue::new(4),
                pending_streaming: DashMap::new(),
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                started_at: Utc::now(),
                agent_version: ArcSwapOption::empty(),
                mappings: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    #[tokio::test]
    async fn manager_replace_disposes_previous_session() {
        let manager = SessionManager::new();
        let session1 = bare_session();
        manager.replace(session1.clone()).await;
        manager.replace(bare_session()).await;

        assert!(session1.is_disposed());
    }
}
