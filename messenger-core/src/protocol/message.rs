//! Message model and the reserved internal types

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::topics::SubscriptionPattern;

/// Marker that starts every internal message type.
pub const RESERVED_PREFIX: char = '_';

/// Keep-alive sent by clients on a fixed period
pub const HEARTBEAT_TYPE: &str = "_Heartbeat";
/// Adds the pattern carried in the payload to the sender's subscriptions
pub const LISTEN_TYPE: &str = "_Listen";
/// Removes the pattern carried in the payload from the sender's subscriptions
pub const UNLISTEN_TYPE: &str = "_Unlisten";
/// Sent by a client that is about to close its connection on purpose
pub const DISCONNECT_TYPE: &str = "_Disconnect";

/// Longest type string the u16 length prefix can carry.
pub const MAX_TYPE_LENGTH: usize = u16::MAX as usize;

/// Largest payload a message may carry on the wire (2^31 - 1 bytes).
pub const MAX_PAYLOAD_LENGTH: usize = i32::MAX as usize;

/// Internal message kinds, recognised by their reserved type string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Heartbeat,
    Listen,
    Unlisten,
    Disconnect,
}

impl ControlKind {
    pub fn from_type(msg_type: &str) -> Option<Self> {
        match msg_type {
            HEARTBEAT_TYPE => Some(ControlKind::Heartbeat),
            LISTEN_TYPE => Some(ControlKind::Listen),
            UNLISTEN_TYPE => Some(ControlKind::Unlisten),
            DISCONNECT_TYPE => Some(ControlKind::Disconnect),
            _ => None,
        }
    }

    pub const fn as_type(self) -> &'static str {
        match self {
            ControlKind::Heartbeat => HEARTBEAT_TYPE,
            ControlKind::Listen => LISTEN_TYPE,
            ControlKind::Unlisten => UNLISTEN_TYPE,
            ControlKind::Disconnect => DISCONNECT_TYPE,
        }
    }
}

/// A published message: a routing type string and an opaque payload.
///
/// Messages are immutable once built. Every constructor enforces the wire
/// limits, so any `Message` value can be encoded without further checks.
/// The payload is reference counted, which keeps fan-out to many
/// subscribers free of copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    msg_type: String,
    payload: Bytes,
}

impl Message {
    /// Build a message, rejecting an empty or oversized type and an oversized payload.
    pub fn new(msg_type: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let msg_type = msg_type.into();
        let payload = payload.into();
        validate_type(&msg_type)?;
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                max_size: MAX_PAYLOAD_LENGTH,
                actual_size: payload.len(),
            });
        }
        Ok(Self { msg_type, payload })
    }

    /// Build a message on behalf of application code.
    ///
    /// Same as [`Message::new`], but also refuses the reserved internal types.
    pub fn user(msg_type: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let message = Self::new(msg_type, payload)?;
        if message.is_reserved() {
            return Err(ProtocolError::ReservedType {
                msg_type: message.msg_type,
            });
        }
        Ok(message)
    }

    pub fn heartbeat() -> Self {
        Self::control(ControlKind::Heartbeat, Bytes::new())
    }

    pub fn listen(pattern: &SubscriptionPattern) -> Self {
        Self::control(ControlKind::Listen, Bytes::from(pattern.to_string()))
    }

    pub fn unlisten(pattern: &SubscriptionPattern) -> Self {
        Self::control(ControlKind::Unlisten, Bytes::from(pattern.to_string()))
    }

    pub fn disconnect_notice() -> Self {
        Self::control(ControlKind::Disconnect, Bytes::new())
    }

    fn control(kind: ControlKind, payload: Bytes) -> Self {
        Self {
            msg_type: kind.as_type().to_owned(),
            payload,
        }
    }

    /// Used by the decoder, which has already checked every limit.
    pub(crate) fn from_parts(msg_type: String, payload: Bytes) -> Self {
        Self { msg_type, payload }
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// True for any type starting with [`RESERVED_PREFIX`], known or not.
    pub fn is_reserved(&self) -> bool {
        is_reserved_type(&self.msg_type)
    }

    pub fn control_kind(&self) -> Option<ControlKind> {
        ControlKind::from_type(&self.msg_type)
    }

    /// Length of this message once framed on the wire.
    pub fn encoded_len(&self) -> usize {
        2 + self.msg_type.len() + 4 + self.payload.len()
    }
}

impl core::fmt::Display for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Message {{ type: {}, payload: {} bytes }}",
            self.msg_type,
            self.payload.len()
        )
    }
}

pub fn is_reserved_type(msg_type: &str) -> bool {
    msg_type.starts_with(RESERVED_PREFIX)
}

fn validate_type(msg_type: &str) -> Result<(), ProtocolError> {
    if msg_type.is_empty() {
        return Err(ProtocolError::TypeEmpty);
    }
    if msg_type.len() > MAX_TYPE_LENGTH {
        return Err(ProtocolError::TypeTooLong {
            max_length: MAX_TYPE_LENGTH,
            actual_length: msg_type.len(),
        });
    }
    Ok(())
}
