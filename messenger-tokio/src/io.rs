use bytes::{Bytes, BytesMut};
use messenger_core::protocol::{
    decode_identity, encode_identity, encode_message, ClientIdentity, FrameDecoder, Message,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MessengerError, Result};

const READ_CHUNK: usize = 4096;

/// Read the identity frame that opens every connection.
///
/// Returns `Ok(None)` if the peer closed the stream before sending anything.
pub async fn read_identity<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<Option<ClientIdentity>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(identity) = decode_identity(buffer)? {
            return Ok(Some(identity));
        }
        buffer.reserve(READ_CHUNK);
        if reader.read_buf(buffer).await? == 0 {
            return if buffer.is_empty() {
                Ok(None)
            } else {
                Err(MessengerError::ConnectionClosed)
            };
        }
    }
}

/// Read the next message frame from the stream.
///
/// Cancel safe: partial progress lives in `buffer` and `decoder`, which the
/// caller keeps across calls, so this can sit in a `tokio::select!` arm.
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_message<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    decoder: &mut FrameDecoder,
) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(message) = decoder.decode(buffer)? {
            return Ok(Some(message));
        }
        buffer.reserve(READ_CHUNK);
        if reader.read_buf(buffer).await? == 0 {
            return if buffer.is_empty() && decoder.is_idle() {
                Ok(None)
            } else {
                Err(MessengerError::ConnectionClosed)
            };
        }
    }
}

/// Encode a message into Bytes for zero-copy transmission
pub fn encode_frame(message: &Message) -> Bytes {
    let mut buffer = BytesMut::with_capacity(message.encoded_len());
    encode_message(message, &mut buffer);
    buffer.freeze()
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(message)).await?;
    writer.flush().await
}

pub async fn write_identity<W>(writer: &mut W, identity: &ClientIdentity) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::new();
    encode_identity(identity, &mut buffer);
    writer.write_all(&buffer).await?;
    writer.flush().await
}
