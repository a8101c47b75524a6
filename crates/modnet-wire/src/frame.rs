//! Frame codec and fixed-field packet access.
//!
//! Every unit on a modnet connection is one frame: a 4-byte big-endian length
//! header followed by the payload. Payloads are built from fixed fields
//! (`u32` big-endian, length-prefixed strings, NUL-padded names) or carry a
//! single JSON document.

use crate::error::{PacketError, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a payload as one frame (4-byte big-endian length + payload).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Read one frame from a byte stream.
///
/// A clean end of stream before the header maps to
/// [`WireError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Builder for fixed-field payloads.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_string(mut self, value: &str) -> Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// A name padded with NULs to exactly `width` bytes.
    pub fn put_fixed_str(mut self, value: &str, width: usize) -> Result<Self, PacketError> {
        let raw = value.as_bytes();
        if raw.len() > width {
            return Err(PacketError::FieldTooLong {
                len: raw.len(),
                max: width,
            });
        }
        self.buf.put_slice(raw);
        self.buf.put_bytes(0, width - raw.len());
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor over one received payload.
///
/// Established-connection callbacks must consume the whole payload; the
/// connection manager checks [`PacketReader::is_drained`] after each call.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
    total: usize,
}

impl PacketReader {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let buf = payload.into();
        let total = buf.len();
        Self { buf, total }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn consumed(&self) -> usize {
        self.total - self.buf.remaining()
    }

    pub fn is_drained(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), PacketError> {
        if self.buf.remaining() < needed {
            return Err(PacketError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32, PacketError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes, PacketError> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_string(&mut self) -> Result<String, PacketError> {
        let len = self.get_u32()? as usize;
        let raw = self.get_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Read a NUL-padded name of exactly `width` bytes.
    pub fn get_fixed_str(&mut self, width: usize) -> Result<String, PacketError> {
        let raw = self.get_bytes(width)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
        String::from_utf8(raw[..end].to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Take everything that is left.
    pub fn take_rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    /// Decode the rest of the payload as one JSON document.
    pub fn take_json<T: DeserializeOwned>(&mut self) -> Result<T, serde_json::Error> {
        let rest = self.take_rest();
        serde_json::from_slice(&rest)
    }
}

/// Serialize one JSON payload.
pub fn json_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefix() {
        let bytes = encode_frame(b"hello");
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(&bytes[4..], b"hello");
    }

    #[test]
    fn test_fixed_fields() {
        let payload = PacketWriter::new()
            .put_fixed_str("overlay", 80)
            .unwrap()
            .put_u32(3)
            .put_string("viewer")
            .finish();
        assert_eq!(payload.len(), 80 + 4 + 4 + 6);

        let mut reader = PacketReader::new(payload);
        assert_eq!(reader.get_fixed_str(80).unwrap(), "overlay");
        assert_eq!(reader.get_u32().unwrap(), 3);
        assert!(!reader.is_drained());
        assert_eq!(reader.get_string().unwrap(), "viewer");
        assert!(reader.is_drained());
        assert_eq!(reader.consumed(), 94);
    }

    #[test]
    fn test_fixed_str_too_long() {
        let name = "x".repeat(81);
        let err = PacketWriter::new().put_fixed_str(&name, 80).unwrap_err();
        assert_eq!(err, PacketError::FieldTooLong { len: 81, max: 80 });
    }

    #[test]
    fn test_truncated_read() {
        let mut reader = PacketReader::new(vec![0u8, 1]);
        assert_eq!(
            reader.get_u32().unwrap_err(),
            PacketError::Truncated {
                needed: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_take_json_drains() {
        let payload = json_payload(&vec![1u32, 2, 3]).unwrap();
        let mut reader = PacketReader::new(payload);
        let decoded: Vec<u32> = reader.take_json().unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
        assert!(reader.is_drained());
    }

    #[tokio::test]
    async fn test_read_write_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"ping").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(&frame[..], b"ping");

        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        match read_frame(&mut b).await {
            Err(WireError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }
}
