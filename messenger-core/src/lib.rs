//! # Messenger Core
//!
//! Runtime-agnostic core of the Messenger publish/subscribe broker.
//!
//! This library contains the wire protocol, the subscription registry, the
//! broker state machine and the client-side handler table. It performs no
//! I/O and has no async runtime dependencies.
//!
//! ## Features
//!
//! - **Resumable framing** - Decoder state survives partial reads
//! - **Exact and prefix subscriptions** - `"Sensor/X"` or `"Sensor/*"`
//! - **Once-per-connection fan-out** - Overlapping patterns never duplicate a delivery
//! - **Pluggable event sink** - Connect, disconnect, listen and message events
//!
//! ## Limitations
//!
//! - No delivery guarantees beyond TCP ordering on a live connection
//! - No authentication, encryption or persistence

pub mod broker;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod sink;
pub mod topics;

pub use broker::{Broker, Connection, ConnectionId, Dispatch};
pub use error::{BrokerError, ProtocolError};
pub use handlers::{HandlerError, HandlerSet};
pub use protocol::{ClientIdentity, FrameDecoder, Message};
pub use sink::{EventKind, EventSink, LogSink, NoopSink};
pub use topics::{SubscriptionPattern, TopicRegistry};
