#![forbid(unsafe_code)]

//! Wire framing for the legacy lobby protocol.
//!
//! # Wire format
//!
//! Text frames carry UTF-16BE payloads behind two big-endian signed 32-bit
//! length prefixes:
//!
//! ```text
//! [outer: i32 = 4 + payload bytes][inner: i32 = payload bytes][UTF-16BE payload]
//! ```
//!
//! An absent payload is a full two-field frame with `outer = 4` and
//! `inner = -1` and no payload bytes; the decoder always reads both prefixes
//! before checking for the sentinel, so absent frames never drift into the
//! next message.
//!
//! Blob frames carry raw bytes behind a single length prefix:
//!
//! ```text
//! [len: i32][raw bytes]
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a declared payload length. Anything larger is treated as a
/// framing error rather than an allocation request.
pub const MAX_PAYLOAD_BYTES: i32 = 16 * 1024 * 1024;

/// Sentinel value of the inner length prefix for an absent payload.
const ABSENT: i32 = -1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad payload length: {0}")]
    BadLength(i32),

    #[error("length prefixes disagree: outer {outer}, inner {inner}")]
    LengthMismatch { outer: i32, inner: i32 },

    #[error("payload is not valid UTF-16")]
    InvalidText,
}

/// Encode a text payload (or the absent sentinel) into a complete frame.
pub fn encode_text(payload: Option<&str>) -> Vec<u8> {
    let Some(payload) = payload else {
        let mut frame = Vec::with_capacity(8);
        frame.extend_from_slice(&4i32.to_be_bytes());
        frame.extend_from_slice(&ABSENT.to_be_bytes());
        return frame;
    };

    let bytes = encode_utf16be(payload);
    let inner = bytes.len() as i32;
    let mut frame = Vec::with_capacity(8 + bytes.len());
    frame.extend_from_slice(&(inner + 4).to_be_bytes());
    frame.extend_from_slice(&inner.to_be_bytes());
    frame.extend_from_slice(&bytes);
    frame
}

/// Write one text frame and flush.
pub async fn write_text<W>(writer: &mut W, payload: Option<&str>) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_text(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one text frame. `Ok(None)` is the absent-payload sentinel.
pub async fn read_text<R>(reader: &mut R) -> Result<Option<String>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let outer = reader.read_i32().await?;
    let inner = reader.read_i32().await?;

    if inner == ABSENT {
        if outer != 4 {
            return Err(CodecError::LengthMismatch { outer, inner });
        }
        return Ok(None);
    }
    if inner < 0 || inner > MAX_PAYLOAD_BYTES {
        return Err(CodecError::BadLength(inner));
    }
    // UTF-16 payloads are two bytes per code unit
    if inner % 2 != 0 {
        return Err(CodecError::BadLength(inner));
    }
    if outer != inner + 4 {
        return Err(CodecError::LengthMismatch { outer, inner });
    }

    let mut buf = vec![0u8; inner as usize];
    reader.read_exact(&mut buf).await?;
    decode_utf16be(&buf).map(Some)
}

/// Write one raw blob frame and flush.
pub async fn write_blob<W>(writer: &mut W, bytes: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(bytes.len()).map_err(|_| CodecError::BadLength(i32::MAX))?;
    if len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::BadLength(len));
    }
    writer.write_i32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one raw blob frame.
pub async fn read_blob<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32().await?;
    if len < 0 || len > MAX_PAYLOAD_BYTES {
        return Err(CodecError::BadLength(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

fn encode_utf16be(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

fn decode_utf16be(bytes: &[u8]) -> Result<String, CodecError> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| CodecError::InvalidText)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(payload: Option<&str>) -> Option<String> {
        let frame = encode_text(payload);
        let mut cursor = frame.as_slice();
        let decoded = read_text(&mut cursor).await.unwrap();
        assert!(cursor.is_empty(), "decoder left {} trailing bytes", cursor.len());
        decoded
    }

    #[tokio::test]
    async fn text_roundtrip() {
        for s in ["", "PING", "{\"command\":\"ask_session\"}", "größer", "日本語"] {
            assert_eq!(roundtrip(Some(s)).await.as_deref(), Some(s));
        }
    }

    #[tokio::test]
    async fn absent_roundtrip_consumes_exact_bytes() {
        let mut stream = encode_text(None);
        stream.extend_from_slice(&encode_text(Some("next")));

        let mut cursor = stream.as_slice();
        assert_eq!(read_text(&mut cursor).await.unwrap(), None);
        assert_eq!(read_text(&mut cursor).await.unwrap().as_deref(), Some("next"));
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn absent_frame_is_two_fields() {
        let frame = encode_text(None);
        assert_eq!(frame, [0, 0, 0, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn rejects_negative_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4i32.to_be_bytes());
        frame.extend_from_slice(&(-7i32).to_be_bytes());
        let err = read_text(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::BadLength(-7)));
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&i32::MAX.to_be_bytes());
        frame.extend_from_slice(&(MAX_PAYLOAD_BYTES + 2).to_be_bytes());
        let err = read_text(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::BadLength(_)));
    }

    #[tokio::test]
    async fn rejects_odd_length() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&7i32.to_be_bytes());
        frame.extend_from_slice(&3i32.to_be_bytes());
        let err = read_text(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::BadLength(3)));
    }

    #[tokio::test]
    async fn rejects_disagreeing_prefixes() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&10i32.to_be_bytes());
        frame.extend_from_slice(&4i32.to_be_bytes());
        frame.extend_from_slice(&[0, 0x41, 0, 0x42]);
        let err = read_text(&mut frame.as_slice()).await.unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { outer: 10, inner: 4 }));
    }

    #[tokio::test]
    async fn truncated_payload_is_io_error() {
        let full = encode_text(Some("hello"));
        let truncated = &full[..full.len() - 2];
        let err = read_text(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[tokio::test]
    async fn blob_roundtrip() {
        let payload = [0u8, 1, 2, 250, 255];
        let mut buf = Vec::new();
        write_blob(&mut buf, &payload).await.unwrap();
        let decoded = read_blob(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn blob_rejects_negative_length() {
        let frame = (-1i32).to_be_bytes();
        let err = read_blob(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, CodecError::BadLength(-1)));
    }
}
