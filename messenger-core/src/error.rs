//! Error types for Messenger core

use crate::broker::ConnectionId;

/// Violations of the wire format or of local message validation.
///
/// Raised synchronously at the call site when building a [`Message`](crate::Message)
/// and fatally (for one connection only) when decoding a peer's frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Message type string is empty
    #[error("Message type is empty")]
    TypeEmpty,
    /// Message type does not fit the u16 length prefix
    #[error("Message type too long: length {actual_length}, max {max_length}")]
    TypeTooLong {
        max_length: usize,
        actual_length: usize,
    },
    /// Payload exceeds the encodable or configured ceiling
    #[error("Payload too large: size {actual_size}, max {max_size}")]
    PayloadTooLarge { max_size: usize, actual_size: usize },
    /// Application tried to publish one of the broker's internal types
    #[error("Message type {msg_type:?} is reserved for internal use")]
    ReservedType { msg_type: String },
    /// Type, name or pattern bytes are not valid UTF-8
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
    /// Client name in the identity frame is empty
    #[error("Client name is empty")]
    NameEmpty,
    /// Client name does not fit the u16 length prefix
    #[error("Client name too long: length {actual_length}, max {max_length}")]
    NameTooLong {
        max_length: usize,
        actual_length: usize,
    },
    /// Identity frame carried a reserved name, i.e. a message frame arrived first
    #[error("Client name {name:?} uses the reserved prefix")]
    ReservedName { name: String },
    /// Listen/unlisten pattern is empty
    #[error("Subscription pattern is empty")]
    PatternEmpty,
}

/// Errors raised by the broker core when operating on its connection table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No connection with the given id is registered
    #[error("Connection {id} was not found")]
    ConnectionNotFound { id: ConnectionId },
    /// Connection sent a malformed control message
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}
