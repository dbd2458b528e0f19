//! Message frame codec
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! u16 type_len | type_len bytes (UTF-8 type) | u32 payload_len | payload_len bytes
//! ```
//!
//! Decoding is resumable: [`FrameDecoder`] keeps an explicit state between
//! calls and consumes bytes from the caller's buffer as soon as each field is
//! complete, so partial reads are never re-parsed.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::message::Message;

/// Default sanity ceiling for a declared payload length (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 1 << 30;

const TYPE_LENGTH_SIZE: usize = 2;
const PAYLOAD_LENGTH_SIZE: usize = 4;

/// Most the buffer is grown by at once while a payload is still arriving.
const PAYLOAD_RESERVE_STEP: usize = 64 * 1024;

/// Append the framed form of `message` to `dst`.
///
/// Infallible: [`Message`] constructors already enforce the wire limits.
pub fn encode_message(message: &Message, dst: &mut BytesMut) {
    dst.reserve(message.encoded_len());
    dst.put_u16(message.msg_type().len() as u16);
    dst.put_slice(message.msg_type().as_bytes());
    dst.put_u32(message.payload().len() as u32);
    dst.put_slice(message.payload());
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecodeState {
    AwaitTypeLength,
    AwaitTypeBytes { len: usize },
    AwaitPayloadLength { msg_type: String },
    AwaitPayloadBytes { msg_type: String, len: usize },
}

/// Streaming decoder for message frames.
///
/// The four states run in strict order, falling through whenever enough
/// bytes are already buffered for the next one. After a message is emitted
/// the decoder is back in its initial state.
///
/// An error is fatal for the stream: the caller is expected to drop the
/// connection rather than keep feeding the decoder.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecodeState,
    max_payload_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload_len(DEFAULT_MAX_PAYLOAD_LENGTH)
    }

    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self {
            state: DecodeState::AwaitTypeLength,
            max_payload_len,
        }
    }

    /// True when no partially decoded frame is pending.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitTypeLength
    }

    /// Decode at most one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; whatever was consumed
    /// so far is remembered in the decoder state.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match core::mem::replace(&mut self.state, DecodeState::AwaitTypeLength) {
                DecodeState::AwaitTypeLength => {
                    if src.len() < TYPE_LENGTH_SIZE {
                        return Ok(None);
                    }
                    let len = src.get_u16() as usize;
                    if len == 0 {
                        return Err(ProtocolError::TypeEmpty);
                    }
                    self.state = DecodeState::AwaitTypeBytes { len };
                }
                DecodeState::AwaitTypeBytes { len } => {
                    if src.len() < len {
                        self.state = DecodeState::AwaitTypeBytes { len };
                        return Ok(None);
                    }
                    let raw = src.split_to(len);
                    let msg_type = core::str::from_utf8(&raw)
                        .map_err(|_| ProtocolError::InvalidUtf8)?
                        .to_owned();
                    self.state = DecodeState::AwaitPayloadLength { msg_type };
                }
                DecodeState::AwaitPayloadLength { msg_type } => {
                    if src.len() < PAYLOAD_LENGTH_SIZE {
                        self.state = DecodeState::AwaitPayloadLength { msg_type };
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len > self.max_payload_len {
                        return Err(ProtocolError::PayloadTooLarge {
                            max_size: self.max_payload_len,
                            actual_size: len,
                        });
                    }
                    self.state = DecodeState::AwaitPayloadBytes { msg_type, len };
                }
                DecodeState::AwaitPayloadBytes { msg_type, len } => {
                    if src.len() < len {
                        src.reserve((len - src.len()).min(PAYLOAD_RESERVE_STEP));
                        self.state = DecodeState::AwaitPayloadBytes { msg_type, len };
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    return Ok(Some(Message::from_parts(msg_type, payload)));
                }
            }
        }
    }
}
