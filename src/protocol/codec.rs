//! Length-prefixed framing for both startup-phase directions.
//!
//! Client startup messages carry no type byte: `Int32 len | body`. Upstream
//! messages do: `Byte1 tag | Int32 len | body`. In both cases `len` counts
//! itself but not the tag.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::protocol::backend::UpstreamMessage;
use crate::protocol::frontend::StartupMessage;
use crate::protocol::ProtocolError;

/// PostgreSQL refuses startup packets above this size; so do we.
pub const MAX_STARTUP_PACKET_LENGTH: usize = 10_000;

/// Upper bound for an upstream message during authentication.
pub const MAX_UPSTREAM_MESSAGE_LENGTH: usize = 1024 * 1024;

const MAX_CSTRING_LENGTH: usize = 64 * 1024;

/// Reads a NUL-terminated string, consuming the terminator.
pub fn get_cstring(src: &mut BytesMut) -> Result<String, ProtocolError> {
    let end = src
        .iter()
        .take(MAX_CSTRING_LENGTH)
        .position(|&b| b == 0)
        .ok_or(ProtocolError::InvalidMessage)?;
    let raw = src.split_to(end);
    src.advance(1);
    Ok(String::from_utf8(raw.to_vec())?)
}

pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

pub async fn write_cstring<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_all(s.as_bytes()).await?;
    w.write_u8(0).await
}

/// Splits one frame off `src` once it is complete.
///
/// `header` is the number of bytes before the length field (0 or 1) and
/// `min_len` the smallest valid length value. The returned frame still
/// starts with its header and length.
fn split_frame(
    src: &mut BytesMut,
    header: usize,
    min_len: usize,
    max_len: usize,
) -> Result<Option<BytesMut>, ProtocolError> {
    let Some(len_bytes) = src.get(header..header + 4) else {
        return Ok(None);
    };
    let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    let len = usize::try_from(len).map_err(|_| ProtocolError::InvalidMessage)?;
    if !(min_len..=max_len).contains(&len) {
        return Err(ProtocolError::InvalidMessage);
    }
    if src.len() < header + len {
        src.reserve(header + len - src.len());
        return Ok(None);
    }
    Ok(Some(src.split_to(header + len)))
}

/// Decodes what a client sends before its session starts.
#[derive(Debug, Clone)]
pub struct StartupCodec {
    max_len: usize,
}

impl StartupCodec {
    pub fn new() -> Self {
        Self {
            max_len: MAX_STARTUP_PACKET_LENGTH,
        }
    }
}

impl Default for StartupCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StartupCodec {
    type Item = StartupMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // length + request code
        let Some(mut frame) = split_frame(src, 0, 8, self.max_len)? else {
            return Ok(None);
        };
        frame.advance(4);
        StartupMessage::decode(frame).map(Some)
    }
}

/// Decodes tagged messages from the upstream while it authenticates us.
#[derive(Debug, Clone)]
pub struct BackendCodec {
    max_len: usize,
}

impl BackendCodec {
    pub fn new() -> Self {
        Self {
            max_len: MAX_UPSTREAM_MESSAGE_LENGTH,
        }
    }
}

impl Default for BackendCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BackendCodec {
    type Item = UpstreamMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(mut frame) = split_frame(src, 1, 4, self.max_len)? else {
            return Ok(None);
        };
        let tag = frame.get_u8();
        frame.advance(4);
        Ok(Some(UpstreamMessage { tag, body: frame }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_cstring() {
        let mut buf = BytesMut::from(&b"user\0alice\0"[..]);
        assert_eq!(get_cstring(&mut buf).unwrap(), "user");
        assert_eq!(get_cstring(&mut buf).unwrap(), "alice");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_get_cstring_errors() {
        let mut unterminated = BytesMut::from(&b"alice"[..]);
        assert!(matches!(
            get_cstring(&mut unterminated),
            Err(ProtocolError::InvalidMessage)
        ));

        let mut not_utf8 = BytesMut::from(&[0xff, 0xfe, 0][..]);
        assert!(matches!(
            get_cstring(&mut not_utf8),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn test_cstring_writers_agree() {
        let mut buffered = BytesMut::new();
        put_cstring(&mut buffered, "orders");
        let mut written = Vec::new();
        write_cstring(&mut written, "orders").await.unwrap();
        assert_eq!(&buffered[..], &written[..]);
        assert_eq!(written, b"orders\0");
    }

    #[test]
    fn test_split_frame_bounds() {
        // Untagged, length below the minimum.
        let mut src = BytesMut::from(&[0, 0, 0, 4, 0, 0, 0, 0][..]);
        assert!(split_frame(&mut src, 0, 8, 100).is_err());

        // Tagged, length above the maximum.
        let mut src = BytesMut::from(&[b'R', 0, 0, 1, 0][..]);
        assert!(split_frame(&mut src, 1, 4, 100).is_err());

        // Header not complete yet.
        let mut src = BytesMut::from(&[b'R', 0, 0][..]);
        assert!(split_frame(&mut src, 1, 4, 100).unwrap().is_none());
    }

    #[test]
    fn test_startup_packet_limit() {
        let mut src = BytesMut::new();
        src.put_i32(MAX_STARTUP_PACKET_LENGTH as i32 + 1);
        src.put_i32(3 << 16);
        assert!(matches!(
            StartupCodec::new().decode(&mut src),
            Err(ProtocolError::InvalidMessage)
        ));
    }
}
