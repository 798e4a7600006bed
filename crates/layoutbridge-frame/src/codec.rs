use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: little-endian payload length (4 bytes).
pub const HEADER_SIZE: usize = 4;

/// Default channel buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Default maximum payload size: the buffer capacity minus the length prefix.
pub const DEFAULT_MAX_PAYLOAD: usize = DEFAULT_BUFFER_SIZE - HEADER_SIZE;

/// Largest payload that fits in a channel buffer of `buffer_size` bytes.
pub fn max_payload_for(buffer_size: usize) -> usize {
    buffer_size.saturating_sub(HEADER_SIZE)
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┐
/// │ Length (4B)  │ Payload          │
/// │ LE           │ (Length bytes)   │
/// └──────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a stream buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes exactly the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    let Some(payload_len) = declared_len(src) else {
        return Ok(None);
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

/// Decode a frame from one complete message-mode read.
///
/// The declared length is checked against the bytes actually transferred;
/// bytes past the declared payload are ignored.
pub fn decode_message(msg: &[u8], max_payload: usize) -> Result<Bytes> {
    let Some(payload_len) = declared_len(msg) else {
        return Err(FrameError::Truncated {
            declared: HEADER_SIZE,
            available: msg.len(),
        });
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let available = msg.len() - HEADER_SIZE;
    if payload_len > available {
        return Err(FrameError::Truncated {
            declared: payload_len,
            available,
        });
    }

    Ok(Bytes::copy_from_slice(
        &msg[HEADER_SIZE..HEADER_SIZE + payload_len],
    ))
}

fn declared_len(src: &[u8]) -> Option<usize> {
    let prefix: [u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as usize)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 508 (512-byte buffer).
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"hello, layoutbridge!";

        encode_frame(payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_at_max_payload() {
        let payload = vec![0x5Au8; DEFAULT_MAX_PAYLOAD];
        let mut buf = BytesMut::new();
        encode_frame(&payload, &mut buf).unwrap();
        assert_eq!(buf.len(), DEFAULT_BUFFER_SIZE);

        let frame = decode_message(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.len(), DEFAULT_MAX_PAYLOAD);
        assert_eq!(frame.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_frame(&[0u8; 0x0102], &mut buf).unwrap();
        assert_eq!(&buf[..HEADER_SIZE], &[0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x08, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), 2, "incomplete input is left untouched");
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4096);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 4096, .. })
        ));
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf).unwrap();
        encode_frame(b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(f1.as_ref(), b"first");
        assert_eq!(f2.as_ref(), b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0, 0, 0, 0]);

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_message_rejects_length_beyond_transferred() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(12);
        buf.put_slice(&[1, 2, 3, 4]);

        let err = decode_message(&buf, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                declared: 12,
                available: 4
            }
        ));
    }

    #[test]
    fn test_decode_message_rejects_short_prefix() {
        let err = decode_message(&[0x01, 0x00], DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { available: 2, .. }));
    }

    #[test]
    fn test_decode_message_ignores_trailing_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(b"abc", &mut buf).unwrap();
        buf.put_slice(b"zz");

        let frame = decode_message(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.as_ref(), b"abc");
    }

    #[test]
    fn test_max_payload_for_buffer() {
        assert_eq!(max_payload_for(512), 508);
        assert_eq!(max_payload_for(2), 0);
    }
}
