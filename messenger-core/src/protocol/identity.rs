//! Identity frame: `u16 name_len | name_len bytes (UTF-8)`
//!
//! Sent exactly once by the client, immediately after the socket connects and
//! before any message frame.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::message::{is_reserved_type, MAX_TYPE_LENGTH};

/// Longest client name the u16 length prefix can carry.
pub const MAX_NAME_LENGTH: usize = MAX_TYPE_LENGTH;

/// Name a client announces in its handshake. Diagnostic only, never an auth token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    name: String,
}

impl ClientIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::NameEmpty);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(ProtocolError::NameTooLong {
                max_length: MAX_NAME_LENGTH,
                actual_length: name.len(),
            });
        }
        // A reserved name is what a heartbeat or listen frame looks like when
        // it is read as an identity frame.
        if is_reserved_type(&name) {
            return Err(ProtocolError::ReservedName { name });
        }
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl core::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

pub fn encode_identity(identity: &ClientIdentity, dst: &mut BytesMut) {
    dst.reserve(2 + identity.name.len());
    dst.put_u16(identity.name.len() as u16);
    dst.put_slice(identity.name.as_bytes());
}

/// Decode the identity frame from the front of `src`.
///
/// Nothing is consumed until the whole frame is buffered; `Ok(None)` means
/// more bytes are needed.
pub fn decode_identity(src: &mut BytesMut) -> Result<Option<ClientIdentity>, ProtocolError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
    if src.len() < 2 + len {
        src.reserve(2 + len - src.len());
        return Ok(None);
    }
    src.advance(2);
    let raw = src.split_to(len);
    let name = core::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    ClientIdentity::new(name).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_layout() {
        let identity = ClientIdentity::new("Robot").unwrap();
        let mut buf = BytesMut::new();
        encode_identity(&identity, &mut buf);
        assert_eq!(buf.as_ref(), &[0x00, 0x05, b'R', b'o', b'b', b'o', b't']);
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut buf = BytesMut::from(&[0x00, 0x03, b'a', b'b'][..]);
        assert_eq!(decode_identity(&mut buf), Ok(None));
        assert_eq!(buf.len(), 4, "partial identity must not be consumed");

        buf.put_u8(b'c');
        buf.put_slice(&[0xAAu8, 0xBB]);
        let identity = decode_identity(&mut buf).unwrap().unwrap();
        assert_eq!(identity.name(), "abc");
        assert_eq!(buf.as_ref(), &[0xAAu8, 0xBB], "trailing bytes belong to the next frame");
    }

    #[test]
    fn test_decode_rejects_reserved_name() {
        let mut buf = BytesMut::new();
        buf.put_u16(10);
        buf.put_slice(b"_Heartbeat");
        assert_eq!(
            decode_identity(&mut buf),
            Err(ProtocolError::ReservedName {
                name: "_Heartbeat".to_owned()
            })
        );
    }

    #[test]
    fn test_decode_rejects_empty_and_invalid_names() {
        let mut empty = BytesMut::from(&[0x00u8, 0x00][..]);
        assert_eq!(decode_identity(&mut empty), Err(ProtocolError::NameEmpty));

        let mut invalid = BytesMut::from(&[0x00u8, 0x01, 0xFF][..]);
        assert_eq!(decode_identity(&mut invalid), Err(ProtocolError::InvalidUtf8));
    }
}
