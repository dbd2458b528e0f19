//! Event sink interface
//!
//! The broker reports every connect, disconnect, listen and unlisten, and
//! every published message, to an [`EventSink`]. Persisting those events
//! (to a file, a database, ...) is up to the sink implementation.

use crate::protocol::Message;

/// Kind of connection lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Listen,
    Unlisten,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Listen => "listen",
            EventKind::Unlisten => "unlisten",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of structured broker events.
///
/// Called with the broker lock held, so implementations should hand work
/// off quickly rather than block.
pub trait EventSink: Send + Sync {
    /// A connection lifecycle event for the client called `name`
    fn log_event(&self, kind: EventKind, name: &str, detail: &str);

    /// A message accepted for fan-out
    fn log_message(&self, message: &Message);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn log_event(&self, _kind: EventKind, _name: &str, _detail: &str) {}

    fn log_message(&self, _message: &Message) {}
}

/// Forwards events to the `log` facade under the `messenger::events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl LogSink {
    pub const TARGET: &'static str = "messenger::events";
}

impl EventSink for LogSink {
    fn log_event(&self, kind: EventKind, name: &str, detail: &str) {
        if detail.is_empty() {
            log::info!(target: Self::TARGET, "{} {}", kind, name);
        } else {
            log::info!(target: Self::TARGET, "{} {} ({})", kind, name, detail);
        }
    }

    fn log_message(&self, message: &Message) {
        log::info!(
            target: Self::TARGET,
            "message {} ({} bytes)",
            message.msg_type(),
            message.payload().len()
        );
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn log_event(&self, kind: EventKind, name: &str, detail: &str) {
        (**self).log_event(kind, name, detail)
    }

    fn log_message(&self, message: &Message) {
        (**self).log_message(message)
    }
}
