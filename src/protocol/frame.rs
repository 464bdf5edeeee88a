use crate::error::ScanError;
use bytes::Bytes;

const FLAG_HAS_MORE: u8 = 0b01;
const FLAG_COMPRESSED: u8 = 0b10;

/// Kind of message a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ScanRequest,
    ScanResponse,
}

impl MessageType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            MessageType::ScanRequest => 1,
            MessageType::ScanResponse => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageType::ScanRequest),
            3 => Some(MessageType::ScanResponse),
            _ => None,
        }
    }
}

/// One unit of the response stream, independent of transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    /// Zero on success; otherwise a server result code
    pub status: u8,
    pub has_more: bool,
    pub compressed: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(payload: Bytes) -> Self {
        Frame {
            msg_type: MessageType::ScanRequest,
            status: 0,
            has_more: false,
            compressed: false,
            payload,
        }
    }

    pub fn response(status: u8, has_more: bool, payload: Bytes) -> Self {
        Frame {
            msg_type: MessageType::ScanResponse,
            status,
            has_more,
            compressed: false,
            payload,
        }
    }

    pub(crate) fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.has_more {
            flags |= FLAG_HAS_MORE;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        flags
    }

    pub(crate) fn apply_flags(&mut self, flags: u8) {
        self.has_more = flags & FLAG_HAS_MORE != 0;
        self.compressed = flags & FLAG_COMPRESSED != 0;
    }

    /// Compress the payload in place
    #[cfg(feature = "compression")]
    pub fn compress(mut self, level: i32) -> Result<Self, ScanError> {
        if self.compressed {
            return Ok(self);
        }
        let packed = zstd::encode_all(&self.payload[..], level)
            .map_err(|e| ScanError::Protocol(format!("compression failed: {}", e)))?;
        self.payload = Bytes::from(packed);
        self.compressed = true;
        Ok(self)
    }

    /// Payload bytes ready for record decoding
    pub fn into_payload(self) -> Result<Bytes, ScanError> {
        if !self.compressed {
            return Ok(self.payload);
        }
        decompress(&self.payload)
    }
}

#[cfg(feature = "compression")]
fn decompress(payload: &[u8]) -> Result<Bytes, ScanError> {
    zstd::decode_all(payload)
        .map(Bytes::from)
        .map_err(|e| ScanError::Protocol(format!("decompression failed: {}", e)))
}

#[cfg(not(feature = "compression"))]
fn decompress(_payload: &[u8]) -> Result<Bytes, ScanError> {
    Err(ScanError::Protocol(
        "compressed frame received but compression support is not enabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut frame = Frame::response(0, true, Bytes::new());
        assert_eq!(frame.flags(), 0b01);
        frame.apply_flags(0b10);
        assert!(!frame.has_more);
        assert!(frame.compressed);
    }

    #[cfg(not(feature = "compression"))]
    #[test]
    fn test_compressed_payload_rejected_without_feature() {
        let mut frame = Frame::response(0, false, Bytes::from_static(b"xx"));
        frame.compressed = true;
        assert!(matches!(frame.into_payload(), Err(ScanError::Protocol(_))));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_payload_restored() {
        let payload = Bytes::from(vec![42u8; 4096]);
        let frame = Frame::response(0, false, payload.clone()).compress(3).unwrap();
        assert!(frame.compressed);
        assert!(frame.payload.len() < payload.len());
        assert_eq!(frame.into_payload().unwrap(), payload);
    }
}
