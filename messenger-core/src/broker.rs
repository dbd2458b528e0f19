//! Messenger broker implementation (core logic)
//!
//! Owns the connection table and the topic registry, decides what to do
//! with every frame a connection sends, and computes fan-out sets. It does no
//! I/O: the runtime layer feeds it decoded messages and delivers to the
//! connections it returns.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::error::{BrokerError, ProtocolError};
use crate::protocol::{ClientIdentity, ControlKind, Message};
use crate::sink::{EventKind, EventSink, NoopSink};
use crate::topics::{SubscriptionPattern, TopicRegistry};

/// Stable handle for a connection inside the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server-side record of one handshaken connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    id: ConnectionId,
    identity: ClientIdentity,
    patterns: BTreeSet<SubscriptionPattern>,
    connected_at: Instant,
    last_heartbeat: Instant,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn patterns(&self) -> &BTreeSet<SubscriptionPattern> {
        &self.patterns
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// When any frame was last received from this connection
    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }
}

/// What the runtime layer must do after the broker handled a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Internal bookkeeping only
    Nothing,
    /// Deliver the message to each of these connections, once
    Deliver(Vec<ConnectionId>),
    /// The client announced it is leaving; close the connection
    Close,
}

/// Messenger broker (core logic)
///
/// All mutation goes through `&mut self`; the runtime keeps the broker behind
/// one lock so that a publish sees either the whole subscriber set of a
/// connection or none of it.
pub struct Broker {
    connections: HashMap<ConnectionId, Connection>,
    topics: TopicRegistry,
    next_id: u64,
    sink: Box<dyn EventSink>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Broker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Broker")
            .field("connections", &self.connections.len())
            .field("subscriptions", &self.topics.subscription_count())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl Broker {
    /// Create a broker that discards its events
    pub fn new() -> Self {
        Self::with_sink(NoopSink)
    }

    pub fn with_sink(sink: impl EventSink + 'static) -> Self {
        Self {
            connections: HashMap::new(),
            topics: TopicRegistry::new(),
            next_id: 1,
            sink: Box::new(sink),
        }
    }

    /// Register a connection whose identity frame has been received.
    ///
    /// `peer` is free-form detail for the event sink, usually the socket address.
    pub fn register(&mut self, identity: ClientIdentity, peer: &str, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        info!("Connection {} registered for client {}", id, identity);
        self.sink.log_event(EventKind::Connect, identity.name(), peer);
        self.connections.insert(
            id,
            Connection {
                id,
                identity,
                patterns: BTreeSet::new(),
                connected_at: now,
                last_heartbeat: now,
            },
        );
        id
    }

    /// Remove a connection and every one of its subscriptions.
    pub fn remove(&mut self, id: ConnectionId, reason: &str) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        let removed = self.topics.remove_connection(id, &connection.patterns);
        info!(
            "Removing connection {} ({}): {}, {} subscription(s) dropped",
            id,
            connection.name(),
            reason,
            removed
        );
        self.sink
            .log_event(EventKind::Disconnect, connection.name(), reason);
        Some(connection)
    }

    /// Add `pattern` to the connection's subscriptions.
    ///
    /// Returns false if the connection already held it.
    pub fn listen(
        &mut self,
        id: ConnectionId,
        pattern: SubscriptionPattern,
    ) -> Result<bool, BrokerError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(BrokerError::ConnectionNotFound { id })?;

        self.topics.listen(id, &pattern);
        let text = pattern.to_string();
        let added = connection.patterns.insert(pattern);
        if added {
            debug!("Connection {} ({}): listen {}", id, connection.name(), text);
            self.sink.log_event(EventKind::Listen, connection.name(), &text);
        }
        Ok(added)
    }

    /// Remove `pattern` from the connection's subscriptions.
    ///
    /// Returns false if the connection did not hold it.
    pub fn unlisten(
        &mut self,
        id: ConnectionId,
        pattern: &SubscriptionPattern,
    ) -> Result<bool, BrokerError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(BrokerError::ConnectionNotFound { id })?;

        let removed = connection.patterns.remove(pattern);
        if removed {
            self.topics.unlisten(id, pattern);
            let text = pattern.to_string();
            debug!("Connection {} ({}): unlisten {}", id, connection.name(), text);
            self.sink
                .log_event(EventKind::Unlisten, connection.name(), &text);
        }
        Ok(removed)
    }

    /// Connections that should receive `message`.
    ///
    /// Reserved internal types are never fanned out. The publisher is not
    /// excluded: it receives its own message if it listens on a match.
    pub fn publish(&self, message: &Message) -> Vec<ConnectionId> {
        if message.is_reserved() {
            return Vec::new();
        }
        self.sink.log_message(message);
        self.topics
            .subscribers(message.msg_type())
            .into_iter()
            .collect()
    }

    /// Record that the connection is alive.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) -> Result<(), BrokerError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(BrokerError::ConnectionNotFound { id })?;
        connection.last_heartbeat = now;
        Ok(())
    }

    /// Handle one frame received from connection `id`.
    ///
    /// Every frame counts as a sign of life. Control messages update the
    /// connection's state; anything else is published.
    pub fn handle_message(
        &mut self,
        id: ConnectionId,
        message: &Message,
        now: Instant,
    ) -> Result<Dispatch, BrokerError> {
        self.touch(id, now)?;

        match message.control_kind() {
            Some(ControlKind::Heartbeat) => {
                trace!("Connection {}: heartbeat", id);
                Ok(Dispatch::Nothing)
            }
            Some(ControlKind::Listen) => {
                let pattern = pattern_from_payload(message)?;
                self.listen(id, pattern)?;
                Ok(Dispatch::Nothing)
            }
            Some(ControlKind::Unlisten) => {
                let pattern = pattern_from_payload(message)?;
                self.unlisten(id, &pattern)?;
                Ok(Dispatch::Nothing)
            }
            Some(ControlKind::Disconnect) => Ok(Dispatch::Close),
            None if message.is_reserved() => {
                debug!(
                    "Connection {}: ignoring unknown internal type {}",
                    id,
                    message.msg_type()
                );
                Ok(Dispatch::Nothing)
            }
            None => Ok(Dispatch::Deliver(self.publish(message))),
        }
    }

    /// Connections silent for longer than `timeout`
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|connection| connection.is_stale(now, timeout))
            .map(Connection::id)
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Patterns currently held by a connection
    pub fn patterns(&self, id: ConnectionId) -> Option<&BTreeSet<SubscriptionPattern>> {
        self.connections.get(&id).map(Connection::patterns)
    }

    pub fn find_by_name(&self, name: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.name() == name)
            .map(Connection::id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }
}

fn pattern_from_payload(message: &Message) -> Result<SubscriptionPattern, ProtocolError> {
    let text = core::str::from_utf8(message.payload()).map_err(|_| ProtocolError::InvalidUtf8)?;
    SubscriptionPattern::parse(text)
}
