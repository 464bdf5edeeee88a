//! Scan Wire Protocol
//!
//! ## Frame Layout (direct socket)
//!
//! ```text
//! ┌─────────┬──────────┬────────┬───────┬────────────────┬──────────────┐
//! │ version │ msg_type │ status │ flags │ payload_len    │ payload      │
//! │ u8 (=2) │ u8       │ u8     │ u8    │ u32 big-endian │ bytes        │
//! └─────────┴──────────┴────────┴───────┴────────────────┴──────────────┘
//! flags: bit 0 = has more frames, bit 1 = payload is zstd-compressed
//! ```
//!
//! The proxy transport carries the same status / has-more / payload triple as
//! discrete RPC messages instead of a byte stream.

pub mod codec;
pub mod frame;
pub mod record;
pub mod request;

pub use codec::FrameCodec;
pub use frame::{Frame, MessageType};
pub use record::{Bins, Entry, Key, PayloadReader, Record, Value};
pub use request::WireRequest;

/// Protocol version carried in every frame header
pub const PROTO_VERSION: u8 = 2;
/// Frame header size in bytes
pub const HEADER_SIZE: usize = 8;
/// Largest payload a frame may declare
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024 * 1024;

/// Server result codes seen by the scan engine
pub mod result_code {
    pub const OK: u8 = 0;
    pub const SERVER_ERROR: u8 = 1;
    pub const PARAMETER_ERROR: u8 = 4;
    pub const TIMEOUT: u8 = 9;
    pub const PARTITION_UNAVAILABLE: u8 = 11;
    pub const SCAN_ABORTED: u8 = 15;
    pub const NAMESPACE_NOT_FOUND: u8 = 20;

    /// Human-readable name of a result code
    pub fn describe(code: u8) -> &'static str {
        match code {
            OK => "ok",
            SERVER_ERROR => "server error",
            PARAMETER_ERROR => "parameter error",
            TIMEOUT => "server timeout",
            PARTITION_UNAVAILABLE => "partition unavailable",
            SCAN_ABORTED => "scan aborted",
            NAMESPACE_NOT_FOUND => "namespace not found",
            _ => "unknown result code",
        }
    }
}
