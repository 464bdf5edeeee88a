//! Scan request encoding
//!
//! ```text
//! [info u8][field_count u16][bin_count u16]
//! field × field_count: [len u32 (type + data)][type u8][data]
//! bin   × bin_count:   [name_len u8][name]
//! ```

use crate::cluster::{Digest, DIGEST_SIZE};
use crate::error::ScanError;
use bytes::{Buf, BufMut, BytesMut};

const INFO_READ: u8 = 0b0001;
const INFO_NO_BIN_DATA: u8 = 0b0010;
const INFO_COMPRESS: u8 = 0b0100;

const FIELD_NAMESPACE: u8 = 0;
const FIELD_SET: u8 = 1;
const FIELD_TASK_ID: u8 = 7;
const FIELD_SOCKET_TIMEOUT: u8 = 9;
const FIELD_MAX_RECORDS: u8 = 10;
const FIELD_PARTITIONS: u8 = 11;
const FIELD_RESUME_DIGESTS: u8 = 12;
const FIELD_KEY_DIGESTS: u8 = 13;

/// Logical request fields, encoded identically for both transports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireRequest {
    pub namespace: String,
    pub set_name: Option<String>,
    /// Empty selects every bin
    pub bin_names: Vec<String>,
    pub task_id: u64,
    pub socket_timeout_ms: u32,
    /// Zero means unlimited
    pub max_records: u64,
    pub read_only: bool,
    pub include_bin_data: bool,
    pub compress_response: bool,
    /// Partitions read from their beginning
    pub partitions: Vec<u16>,
    /// Partitions resumed after a digest
    pub resume: Vec<(u16, Digest)>,
    /// Restrict to these keys
    pub keys: Vec<Digest>,
}

impl WireRequest {
    /// Append the encoded request to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ScanError> {
        let mut info = 0;
        if self.read_only {
            info |= INFO_READ;
        }
        if !self.include_bin_data {
            info |= INFO_NO_BIN_DATA;
        }
        if self.compress_response {
            info |= INFO_COMPRESS;
        }

        let mut fields = 0u16;
        let mut body = BytesMut::new();

        put_field(&mut body, FIELD_NAMESPACE, self.namespace.as_bytes());
        fields += 1;
        if let Some(set) = &self.set_name {
            put_field(&mut body, FIELD_SET, set.as_bytes());
            fields += 1;
        }
        put_field(&mut body, FIELD_TASK_ID, &self.task_id.to_be_bytes());
        fields += 1;
        if self.socket_timeout_ms > 0 {
            put_field(&mut body, FIELD_SOCKET_TIMEOUT, &self.socket_timeout_ms.to_be_bytes());
            fields += 1;
        }
        if self.max_records > 0 {
            put_field(&mut body, FIELD_MAX_RECORDS, &self.max_records.to_be_bytes());
            fields += 1;
        }
        if !self.partitions.is_empty() {
            let data: Vec<u8> = self.partitions.iter().flat_map(|p| p.to_le_bytes()).collect();
            put_field(&mut body, FIELD_PARTITIONS, &data);
            fields += 1;
        }
        if !self.resume.is_empty() {
            let mut data = Vec::with_capacity(self.resume.len() * (2 + DIGEST_SIZE));
            for (pid, digest) in &self.resume {
                data.extend_from_slice(&pid.to_le_bytes());
                data.extend_from_slice(digest.as_bytes());
            }
            put_field(&mut body, FIELD_RESUME_DIGESTS, &data);
            fields += 1;
        }
        if !self.keys.is_empty() {
            let data: Vec<u8> = self.keys.iter().flat_map(|d| d.0).collect();
            put_field(&mut body, FIELD_KEY_DIGESTS, &data);
            fields += 1;
        }

        let bin_count = u16::try_from(self.bin_names.len())
            .map_err(|_| ScanError::Protocol("too many bin names".to_string()))?;

        buf.reserve(5 + body.len());
        buf.put_u8(info);
        buf.put_u16(fields);
        buf.put_u16(bin_count);
        buf.extend_from_slice(&body);
        for name in &self.bin_names {
            let len = u8::try_from(name.len()).map_err(|_| {
                ScanError::Protocol(format!("bin name too long: {} bytes", name.len()))
            })?;
            buf.put_u8(len);
            buf.extend_from_slice(name.as_bytes());
        }
        Ok(())
    }

    /// Decode a request payload (server side, and tests)
    pub fn decode(mut src: &[u8]) -> Result<Self, ScanError> {
        need(src, 5)?;
        let info = src.get_u8();
        let fields = src.get_u16();
        let bins = src.get_u16();

        let mut req = WireRequest {
            read_only: info & INFO_READ != 0,
            include_bin_data: info & INFO_NO_BIN_DATA == 0,
            compress_response: info & INFO_COMPRESS != 0,
            ..Default::default()
        };

        for _ in 0..fields {
            need(src, 5)?;
            let len = src.get_u32() as usize;
            if len == 0 {
                return Err(ScanError::Protocol("zero-length field".to_string()));
            }
            need(src, len)?;
            let field_type = src.get_u8();
            let (data, rest) = src.split_at(len - 1);
            src = rest;
            match field_type {
                FIELD_NAMESPACE => req.namespace = utf8(data)?,
                FIELD_SET => req.set_name = Some(utf8(data)?),
                FIELD_TASK_ID => req.task_id = u64::from_be_bytes(fixed(data)?),
                FIELD_SOCKET_TIMEOUT => req.socket_timeout_ms = u32::from_be_bytes(fixed(data)?),
                FIELD_MAX_RECORDS => req.max_records = u64::from_be_bytes(fixed(data)?),
                FIELD_PARTITIONS => {
                    if data.len() % 2 != 0 {
                        return Err(ScanError::Protocol("odd partition field".to_string()));
                    }
                    req.partitions = data
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                }
                FIELD_RESUME_DIGESTS => {
                    let width = 2 + DIGEST_SIZE;
                    if data.len() % width != 0 {
                        return Err(ScanError::Protocol("ragged resume field".to_string()));
                    }
                    req.resume = data
                        .chunks_exact(width)
                        .map(|c| {
                            let mut d = [0u8; DIGEST_SIZE];
                            d.copy_from_slice(&c[2..]);
                            (u16::from_le_bytes([c[0], c[1]]), Digest(d))
                        })
                        .collect();
                }
                FIELD_KEY_DIGESTS => {
                    if data.len() % DIGEST_SIZE != 0 {
                        return Err(ScanError::Protocol("ragged key digest field".to_string()));
                    }
                    req.keys = data
                        .chunks_exact(DIGEST_SIZE)
                        .map(|c| {
                            let mut d = [0u8; DIGEST_SIZE];
                            d.copy_from_slice(c);
                            Digest(d)
                        })
                        .collect();
                }
                other => {
                    return Err(ScanError::Protocol(format!("unknown field type {}", other)));
                }
            }
        }

        for _ in 0..bins {
            need(src, 1)?;
            let len = src.get_u8() as usize;
            need(src, len)?;
            let (name, rest) = src.split_at(len);
            req.bin_names.push(utf8(name)?);
            src = rest;
        }

        Ok(req)
    }
}

fn put_field(buf: &mut BytesMut, field_type: u8, data: &[u8]) {
    buf.put_u32(data.len() as u32 + 1);
    buf.put_u8(field_type);
    buf.extend_from_slice(data);
}

fn need(src: &[u8], n: usize) -> Result<(), ScanError> {
    if src.len() < n {
        return Err(ScanError::Protocol(format!(
            "request truncated: need {} bytes, have {}",
            n,
            src.len()
        )));
    }
    Ok(())
}

fn utf8(data: &[u8]) -> Result<String, ScanError> {
    String::from_utf8(data.to_vec()).map_err(|e| ScanError::Protocol(e.to_string()))
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], ScanError> {
    data.try_into()
        .map_err(|_| ScanError::Protocol(format!("expected {} bytes, got {}", N, data.len())))
}
