//! Length-prefixed framing for channel messages.
//!
//! Every message on the wire is a 4-byte big-endian payload length followed
//! by the payload. The decoder never yields a partial payload.

use crate::error::{IpcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Default payload limit (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame encoder/decoder with a payload size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u32::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append one frame carrying `payload` to `dst`.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(IpcError::FrameTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    /// Split the next complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame; the
    /// buffered bytes are left untouched.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&src[..HEADER_SIZE]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_payload {
            return Err(IpcError::FrameTooLarge {
                len,
                max: self.max_payload,
            });
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_waits_for_full_header() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_waits_for_full_payload() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 3);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 3);
    }

    #[test]
    fn test_back_to_back_frames_keep_order() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(b"first", &mut buf).unwrap();
        codec.encode(b"", &mut buf).unwrap();
        codec.encode(b"third", &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"first"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b""[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"third"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(b"too long", &mut buf),
            Err(IpcError::FrameTooLarge { len: 8, max: 4 })
        ));

        let mut incoming = BytesMut::new();
        incoming.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut incoming),
            Err(IpcError::FrameTooLarge { len: 1024, max: 4 })
        ));
    }

    proptest! {
        #[test]
        fn test_arbitrary_split_points_yield_whole_frames(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
            chunk in 1usize..17,
        ) {
            let codec = FrameCodec::default();
            let mut wire = BytesMut::new();
            for p in &payloads {
                codec.encode(p, &mut wire).unwrap();
            }

            let mut rx = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                rx.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut rx).unwrap() {
                    decoded.push(frame.to_vec());
                }
            }

            prop_assert_eq!(decoded, payloads);
            prop_assert!(rx.is_empty());
        }
    }
}
