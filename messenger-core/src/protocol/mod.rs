//! Messenger wire protocol
//!
//! Two frame kinds share one TCP stream: a single identity frame from the
//! client, then message frames in both directions.

pub mod codec;
pub mod identity;
pub mod message;

pub use codec::{encode_message, FrameDecoder, DEFAULT_MAX_PAYLOAD_LENGTH};
pub use identity::{decode_identity, encode_identity, ClientIdentity, MAX_NAME_LENGTH};
pub use message::{
    is_reserved_type, ControlKind, Message, DISCONNECT_TYPE, HEARTBEAT_TYPE, LISTEN_TYPE,
    MAX_PAYLOAD_LENGTH, MAX_TYPE_LENGTH, RESERVED_PREFIX, UNLISTEN_TYPE,
};
