//! In-process log ring buffer fanned out to the active tunnel.
//!
//! `LogRing` is the Gateway's own event history: every `tracing` event
//! the process emits is captured by [`TunnelLogLayer`], pushed into a
//! bounded ring with a monotonically increasing id, and (fire-and-forget)
//! sent down to the active Agent as a `GatewayLog` message so the Agent's
//! UI can show a live tail without its own log pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use tunnel_protocol::{LogEntryWire, LogLevel, Message};

const DEFAULT_CAPACITY: usize = 10_000;

/// One stored log event. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl From<LogEntry> for LogEntryWire {
    fn from(entry: LogEntry) -> Self {
        LogEntryWire {
            id: entry.id,
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
        }
    }
}

pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    pub fn push(&self, level: LogLevel, message: String) -> LogEntry {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = LogEntry {
            id,
            timestamp: Utc::now(),
            level,
            message,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Return up to `count` entries with `id < before_id` (or the newest
    /// `count` entries if `before_id == 0`), newest-first, plus whether
    /// any older entry still exists in the ring.
    pub fn page(&self, before_id: u64, count: usize) -> (Vec<LogEntry>, bool) {
        let entries = self.entries.lock();
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .rev()
            .filter(|e| before_id == 0 || e.id < before_id)
            .take(count)
            .cloned()
            .collect();

        let oldest_returned_id = matched.last().map(|e| e.id);
        let has_more = match oldest_returned_id {
            Some(oldest) => entries.iter().any(|e| e.id < oldest),
            None => false,
        };

        matched.shrink_to_fit();
        (matched, has_more)
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Renders a `tracing::Event`'s fields into one line, loosely mirroring
/// what the `fmt` layer would print, for storage in the ring and for the
/// text carried over the wire in `GatewayLog`.
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push((field.name().to_string(), format!("{:?}", value)));
        }
    }
}

fn level_from_tracing(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::ERROR => LogLevel::Error,
        tracing::Level::WARN => LogLevel::Warning,
        tracing::Level::DEBUG | tracing::Level::TRACE => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
    }
}

/// The tunnel attaches to logging as a `tracing_subscriber::Layer` rather
/// than a bespoke logger hook. Installed once at startup alongside the
/// fmt layer.
pub struct TunnelLogLayer {
    ring: std::sync::Arc<LogRing>,
    sink: ArcSwapOption<mpsc::UnboundedSender<Message>>,
}

impl TunnelLogLayer {
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        Self {
            ring,
            sink: ArcSwapOption::empty(),
        }
    }

    /// Called by `SessionManager` whenever the active session changes;
    /// `None` detaches the sink so fan-out becomes a no-op between
    /// sessions rather than piling up in a dead channel.
    pub fn set_sink(&self, sink: Option<mpsc::UnboundedSender<Message>>) {
        self.sink.store(sink.map(std::sync::Arc::new));
    }

    pub fn ring(&self) -> std::sync::Arc<LogRing> {
        self.ring.clone()
    }
}

impl<S> Layer<S> for TunnelLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut rendered = visitor.message.unwrap_or_default();
        for (name, value) in visitor.fields {
            rendered.push_str(&format!(" {name}={value}"));
        }

        let level = level_from_tracing(event.metadata().level());
        let entry = self.ring.push(level, rendered.clone());

        // Fire-and-forget: a send failure (no active tunnel, or a full
        // unbounded channel that's actually closed) never blocks or
        // propagates.
        if let Some(sink) = self.sink.load_full() {
            let _ = sink.send(Message::GatewayLog {
                timestamp: entry.timestamp,
                level: entry.level,
                message: entry.message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let ring = LogRing::new(10);
        let a = ring.push(LogLevel::Info, "a".into());
        let b = ring.push(LogLevel::Info, "b".into());
        assert!(a.id < b.id);
    }

    #[test]
    fn ring_bounds_to_capacity_keeping_newest() {
        let ring = LogRing::new(3);
        for i in 0..10 {
            ring.push(LogLevel::Info, format!("entry-{i}"));
        }
        let (page, _) = ring.page(0, 10);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].message, "entry-9");
        assert_eq!(page[2].message, "entry-7");
    }

    #[test]
    fn pagination_walks_backwards_with_has_more() {
        let ring = LogRing::new(10_000);
        for i in 1..=12_000u64 {
            ring.push(LogLevel::Info, format!("entry-{i}"));
        }

        let (first_page, has_more) = ring.page(0, 100);
        assert_eq!(first_page.len(), 100);
        assert_eq!(first_page[0].id, 12_000);
        assert_eq!(first_page[99].id, 11_901);
        assert!(has_more);

        let (second_page, has_more2) = ring.page(11_901, 100);
        assert_eq!(second_page[0].id, 11_900);
        assert_eq!(second_page[99].id, 11_801);
        assert!(has_more2);
    }

    #[test]
    fn before_id_zero_means_newest() {
        let ring = LogRing::new(10);
        for i in 0..5 {
            ring.push(LogLevel::Info, format!("{i}"));
        }
        let (page, has_more) = ring.page(0, 2);
        assert_eq!(page.len(), 2);
        assert!(!has_more || page.len() < 5);
    }
}
