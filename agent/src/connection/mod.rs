//! The steady-state tunnel connection: framing is handled by
//! [`crate::transport::AgentSocket`], this module owns the three
//! long-lived tasks that move messages across it (receive, send,
//! heartbeat) plus the correlation tables that let a `Response` or
//! `GetLogsResponse` find its way back to the caller that is awaiting it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tunnel_protocol::Message;

use crate::transport::{AgentSocket, AgentSocketReader, AgentSocketWriter};

/// Outbound frames are queued here rather than sent inline so that a slow
/// websocket write never blocks whoever produced the message. Capacity is
/// bounded; once full the oldest queued frame is dropped to make room,
/// since a stale heartbeat or stale log line is worse than none.
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

/// A live connection to the Gateway.
///
/// Cloning this handle is cheap (it is reference-counted internally via
/// `Arc`'d fields); all clones observe the same queue, tables and
/// cancellation scope.
#[derive(Clone)]
pub struct TunnelConnection {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: OutboundQueue,
    pending_oneshot: DashMap<String, oneshot::Sender<Message>>,
    pending_streaming: DashMap<String, mpsc::Sender<Message>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl TunnelConnection {
    /// Take ownership of an already-authenticated socket and start the
    /// recv/send/heartbeat loops. `incoming_requests` receives every
    /// `Request` message that opens a new forwarded call; the driver
    /// hands those off to the forwarder.
    pub fn spawn(
        socket: AgentSocket,
        heartbeat_interval: Duration,
        incoming_requests: mpsc::Sender<Message>,
    ) -> Self {
        let inner = Arc::new(Inner {
            outbound: OutboundQueue::new(DEFAULT_OUTBOUND_CAPACITY),
            pending_oneshot: DashMap::new(),
            pending_streaming: DashMap::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        let conn = Self { inner };

        let (reader, writer) = socket.into_split();

        tokio::spawn(recv_loop(conn.inner.clone(), reader, incoming_requests));
        tokio::spawn(send_loop(conn.inner.clone(), writer));
        tokio::spawn(heartbeat_loop(conn.inner.clone(), heartbeat_interval));

        conn
    }

    /// Queue a message for delivery to the Gateway.
    pub async fn enqueue(&self, message: Message) {
        self.inner.outbound.push(message).await;
    }

    /// Register interest in a single correlated reply (e.g. `ConfigAck`,
    /// `UpdateResponse`, `GetLogsResponse`) keyed by an id the caller
    /// embeds in the outbound message.
    pub fn register_oneshot(&self, key: String) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_oneshot.insert(key, tx);
        rx
    }

    /// Register a streaming channel that receives every `RequestBodyChunk`
    /// carrying this `request_id`.
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

    /// Tear the connection down: cancels the owned tasks and fails every
    /// outstanding oneshot waiter so callers don't hang forever.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.pending_oneshot.clear();
        self.inner.pending_streaming.clear();
    }
}

async fn recv_loop(inner: Arc<Inner>, mut reader: AgentSocketReader, incoming_requests: mpsc::Sender<Message>) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }

        let received = reader.recv_message().await;

        match received {
            Ok(Some(message)) => dispatch_inbound(&inner, &incoming_requests, message).await,
            Ok(None) => {
                debug!("gateway connection closed, ending receive loop");
                inner.cancel.cancel();
                return;
            }
            Err(e) => {
                error!(error = %e, "error receiving from gateway");
                inner.cancel.cancel();
                return;
            }
        }
    }
}

async fn dispatch_inbound(inner: &Arc<Inner>, incoming_requests: &mpsc::Sender<Message>, message: Message) {
    match &message {
        Message::Request { .. } => {
            if incoming_requests.send(message).await.is_err() {
                warn!("no receiver for incoming request, dropping");
            }
        }
        Message::RequestBodyChunk { request_id, .. } => {
            if let Some(sender) = inner.pending_streaming.get(request_id) {
                let _ = sender.send(message).await;
            } else {
                debug!(request_id = %request_id, "body chunk for unknown or completed request");
            }
        }
        Message::AuthResult { .. }
        | Message::ConfigAck { .. }
        | Message::UpdateResponse { .. }
        | Message::HeartbeatAck { .. } => {
            let key = message.kind().to_string();
            complete_oneshot(inner, &key, message);
        }
        Message::GetLogsResponse { request_id, .. } => {
            let key = request_id.clone();
            complete_oneshot(inner, &key, message);
        }
        Message::Disconnect { reason } => {
            warn!(reason = %reason, "gateway requested disconnect");
            inner.cancel.cancel();
        }
        Message::Error { code, message: text } => {
            warn!(code, message = %text, "gateway reported an error");
        }
        other => {
            debug!(kind = other.kind(), "unhandled message kind on agent side");
        }
    }
}

fn complete_oneshot(inner: &Arc<Inner>, key: &str, message: Message) {
    if let Some((_, sender)) = inner.pending_oneshot.remove(key) {
        let _ = sender.send(message);
    }
}

async fn send_loop(inner: Arc<Inner>, mut writer: AgentSocketWriter) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            message = inner.outbound.pop() => {
                if let Err(e) = writer.send_message(&message).await {
                    error!(error = %e, "error sending to gateway");
                    inner.cancel.cancel();
                    return;
                }
            }
            ping = writer.recv_ping() => {
                match ping {
                    Some(payload) => {
                        if let Err(e) = writer.send_pong(payload).await {
                            error!(error = %e, "error sending pong to gateway");
                            inner.cancel.cancel();
                            return;
                        }
                    }
                    None => {
                        // Reader half dropped; nothing left to forward pings from.
                    }
                }
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {
                let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;
                inner.outbound.push(Message::Heartbeat { timestamp_ms }).await;
            }
        }
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

    #[tokio::test]
    async fn outbound_queue_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.pop().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Message::Heartbeat { timestamp_ms: 42 }).await;

        let message = handle.await.unwrap();
        match message {
            Message::Heartbeat { timestamp_ms } => assert_eq!(timestamp_ms, 42),
            _ => panic!("unexpected message"),
        }
    }
}
