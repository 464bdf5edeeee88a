//! Length-prefixed frame codec for the direct socket transport

use super::frame::{Frame, MessageType};
use super::{HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTO_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Error as IoError, ErrorKind};
use tokio_util::codec::{Decoder, Encoder};

/// Frames on a byte stream. Malformed headers surface as `InvalidData`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        FrameCodec { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = IoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, IoError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let version = src[0];
        if version != PROTO_VERSION {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("unsupported protocol version {}", version),
            ));
        }
        let msg_type = MessageType::from_byte(src[1]).ok_or_else(|| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("unknown message type {}", src[1]),
            )
        })?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_payload {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!("frame payload {} exceeds limit {}", len, self.max_payload),
            ));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let status = src[2];
        let flags = src[3];
        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        let mut frame = Frame {
            msg_type,
            status,
            has_more: false,
            compressed: false,
            payload,
        };
        frame.apply_flags(flags);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = IoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), IoError> {
        if frame.payload.len() > self.max_payload {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!(
                    "frame payload {} exceeds limit {}",
                    frame.payload.len(),
                    self.max_payload
                ),
            ));
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_u8(PROTO_VERSION);
        dst.put_u8(frame.msg_type.to_byte());
        dst.put_u8(frame.status);
        dst.put_u8(frame.flags());
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::response(0, true, Bytes::from_static(b"hello")), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert!(frame.has_more);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::response(0, true, Bytes::from_static(b"a")), &mut buf).unwrap();
        codec.encode(Frame::response(11, false, Bytes::new()), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.status, 0);
        assert_eq!(second.status, 11);
        assert!(!second.has_more);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[9u8, 3, 0, 0, 0, 0, 0, 0][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::from(&[PROTO_VERSION, 3, 0, 0, 0, 0, 0, 5][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
