//! Wire framing for the core-to-core protocol: a fixed 9-byte header
//! followed by a length-prefixed, `bincode`-encoded body.
//!
//! Header layout (all big-endian): `u32 magic`, `u32 payload_len`, `u8 type`.
//! `type` lets a reader validate the body against the expected [`MessageType`]
//! before attempting to decode it — a mismatch is a [`ProtocolError::MalformedFrame`]
//! and the caller closes the socket, per spec "mismatched type/body raises
//! MalformedFrame and closes the socket".

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::messages::MessageType;

/// Distinguishes this protocol's frames from stray bytes on a socket that
/// isn't actually speaking it.
pub const MAGIC: u32 = 0xD1_AA_AA_01;

/// Hard ceiling on a single frame's body, independent of any one message's
/// own size fields — guards against a malicious or corrupt `payload_len`
/// causing an unbounded allocation.
pub const MAX_FRAME_BODY: u32 = 64 * 1024 * 1024;

pub struct FrameHeader {
    pub payload_len: u32,
    pub message_type: MessageType,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; 9] {
        let mut buf = [0u8; 9];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8] = self.message_type as u8;
        buf
    }
}

/// Read and validate a 9-byte header, returning the expected body length and
/// message type. Does not read the body.
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FrameHeader, ProtocolError> {
    let mut buf = [0u8; 9];
    reader.read_exact(&mut buf).await?;
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(ProtocolError::MalformedFrame { reason: format!("bad magic {magic:#x}") });
    }
    let payload_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    if payload_len > MAX_FRAME_BODY {
        return Err(ProtocolError::MessageTooLarge { size: payload_len, max: MAX_FRAME_BODY });
    }
    let message_type = MessageType::from_u8(buf[8])
        .ok_or(ProtocolError::UnknownMessageType(buf[8]))?;
    Ok(FrameHeader { payload_len, message_type })
}

/// Read exactly `len` bytes of frame body.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a full frame: header plus a pre-encoded body.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message_type: MessageType,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let header = FrameHeader { payload_len: body.len() as u32, message_type };
    writer.write_all(&header.encode()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_header_and_body() {
        let mut buf = Vec::new();
        write_frame(&mut buf, MessageType::GetEntries, b"hello").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(header.payload_len, 5);
        assert_eq!(header.message_type, MessageType::GetEntries);
        let body = read_body(&mut cursor, header.payload_len).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn bad_magic_is_malformed_frame() {
        let mut buf = vec![0u8; 9];
        buf[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame { .. }));
    }

    #[tokio::test]
    async fn oversized_payload_rejected_before_allocating() {
        let mut buf = vec![0u8; 9];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&(MAX_FRAME_BODY + 1).to_be_bytes());
        buf[8] = MessageType::GetChunk as u8;
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }
}
