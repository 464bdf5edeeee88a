//! Record payload encoding
//!
//! A response payload is a sequence of entries:
//!
//! ```text
//! [len u32 (kind + body)][kind u8][body]
//!
//! kind 0, record:
//!   [partition u16][digest 20][generation u32][expiration u32]
//!   [set_len u8][set][bin_count u16]
//!   bin × bin_count: [name_len u8][name][particle u8][value_len u32][value]
//!
//! kind 1, partition done:
//!   [partition u16][result_code u8]
//! ```
//!
//! An empty set name is decoded as no set.

use crate::cluster::{Digest, DIGEST_SIZE};
use crate::error::ScanError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;

const KIND_RECORD: u8 = 0;
const KIND_PARTITION_DONE: u8 = 1;

const PARTICLE_NIL: u8 = 0;
const PARTICLE_INT: u8 = 1;
const PARTICLE_FLOAT: u8 = 2;
const PARTICLE_STRING: u8 = 3;
const PARTICLE_BLOB: u8 = 4;
const PARTICLE_BOOL: u8 = 5;

/// Bin value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    Bool(bool),
}

impl Value {
    fn particle(&self) -> u8 {
        match self {
            Value::Nil => PARTICLE_NIL,
            Value::Int(_) => PARTICLE_INT,
            Value::Float(_) => PARTICLE_FLOAT,
            Value::String(_) => PARTICLE_STRING,
            Value::Blob(_) => PARTICLE_BLOB,
            Value::Bool(_) => PARTICLE_BOOL,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Bins of a record, ordered by name
pub type Bins = BTreeMap<String, Value>;

/// Record identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub namespace: Arc<str>,
    pub set_name: Option<String>,
    pub digest: Digest,
}

/// One record delivered by a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Key,
    pub bins: Bins,
    pub generation: u32,
    pub expiration: u32,
}

/// One decoded payload entry
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Record { partition: u16, record: Record },
    /// Server finished (code 0) or gave up on (non-zero) a partition
    PartitionDone { partition: u16, result_code: u8 },
}

/// Iterates the entries of one payload. Stops after the first decode error.
pub struct PayloadReader {
    namespace: Arc<str>,
    buf: Bytes,
    failed: bool,
}

impl PayloadReader {
    pub fn new(namespace: Arc<str>, payload: Bytes) -> Self {
        PayloadReader {
            namespace,
            buf: payload,
            failed: false,
        }
    }

    fn next_entry(&mut self) -> Result<Entry, ScanError> {
        need(&self.buf, 5, "entry header")?;
        let len = self.buf.get_u32() as usize;
        if len == 0 {
            return Err(ScanError::Protocol("zero-length payload entry".to_string()));
        }
        need(&self.buf, len, "entry body")?;
        let mut body = self.buf.split_to(len);
        let kind = body.get_u8();

        let entry = match kind {
            KIND_RECORD => self.decode_record(&mut body)?,
            KIND_PARTITION_DONE => {
                need(&body, 3, "partition done")?;
                Entry::PartitionDone {
                    partition: body.get_u16(),
                    result_code: body.get_u8(),
                }
            }
            other => {
                return Err(ScanError::Protocol(format!("unknown entry kind {}", other)));
            }
        };

        if body.has_remaining() {
            return Err(ScanError::Protocol(format!(
                "{} trailing bytes in payload entry",
                body.remaining()
            )));
        }
        Ok(entry)
    }

    fn decode_record(&self, body: &mut Bytes) -> Result<Entry, ScanError> {
        need(body, 2 + DIGEST_SIZE + 8 + 1, "record header")?;
        let partition = body.get_u16();
        let mut digest = [0u8; DIGEST_SIZE];
        body.copy_to_slice(&mut digest);
        let generation = body.get_u32();
        let expiration = body.get_u32();

        let set_len = body.get_u8() as usize;
        need(body, set_len, "set name")?;
        let set = utf8(body.split_to(set_len))?;
        let set_name = (!set.is_empty()).then_some(set);

        need(body, 2, "bin count")?;
        let bin_count = body.get_u16();
        let mut bins = Bins::new();
        for _ in 0..bin_count {
            need(body, 1, "bin name length")?;
            let name_len = body.get_u8() as usize;
            need(body, name_len + 5, "bin")?;
            let name = utf8(body.split_to(name_len))?;
            let particle = body.get_u8();
            let value_len = body.get_u32() as usize;
            need(body, value_len, "bin value")?;
            let value = decode_value(particle, body.split_to(value_len))?;
            bins.insert(name, value);
        }

        Ok(Entry::Record {
            partition,
            record: Record {
                key: Key {
                    namespace: self.namespace.clone(),
                    set_name,
                    digest: Digest(digest),
                },
                bins,
                generation,
                expiration,
            },
        })
    }
}

impl Iterator for PayloadReader {
    type Item = Result<Entry, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.buf.has_remaining() {
            return None;
        }
        let entry = self.next_entry();
        if entry.is_err() {
            self.failed = true;
        }
        Some(entry)
    }
}

fn decode_value(particle: u8, mut data: Bytes) -> Result<Value, ScanError> {
    let value = match particle {
        PARTICLE_NIL => Value::Nil,
        PARTICLE_INT => {
            need(&data, 8, "int value")?;
            Value::Int(data.get_i64())
        }
        PARTICLE_FLOAT => {
            need(&data, 8, "float value")?;
            Value::Float(data.get_f64())
        }
        PARTICLE_STRING => Value::String(utf8(data)?),
        PARTICLE_BLOB => Value::Blob(data),
        PARTICLE_BOOL => {
            need(&data, 1, "bool value")?;
            Value::Bool(data.get_u8() != 0)
        }
        other => {
            return Err(ScanError::Protocol(format!("unknown particle type {}", other)));
        }
    };
    Ok(value)
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), ScanError> {
    if buf.remaining() < n {
        return Err(ScanError::Protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn utf8(data: Bytes) -> Result<String, ScanError> {
    String::from_utf8(data.to_vec()).map_err(|e| ScanError::Protocol(e.to_string()))
}

/// Append a record entry to a response payload
pub fn encode_record(buf: &mut BytesMut, partition: u16, record: &Record) -> Result<(), ScanError> {
    let set = record.key.set_name.as_deref().unwrap_or("");
    let set_len = u8::try_from(set.len())
        .map_err(|_| ScanError::Protocol(format!("set name too long: {} bytes", set.len())))?;
    let bin_count = u16::try_from(record.bins.len())
        .map_err(|_| ScanError::Protocol("too many bins".to_string()))?;

    let mut body = BytesMut::with_capacity(64);
    body.put_u8(KIND_RECORD);
    body.put_u16(partition);
    body.extend_from_slice(record.key.digest.as_bytes());
    body.put_u32(record.generation);
    body.put_u32(record.expiration);
    body.put_u8(set_len);
    body.extend_from_slice(set.as_bytes());
    body.put_u16(bin_count);
    for (name, value) in &record.bins {
        let name_len = u8::try_from(name.len())
            .map_err(|_| ScanError::Protocol(format!("bin name too long: {} bytes", name.len())))?;
        body.put_u8(name_len);
        body.extend_from_slice(name.as_bytes());
        body.put_u8(value.particle());
        match value {
            Value::Nil => body.put_u32(0),
            Value::Int(v) => {
                body.put_u32(8);
                body.put_i64(*v);
            }
            Value::Float(v) => {
                body.put_u32(8);
                body.put_f64(*v);
            }
            Value::String(s) => {
                body.put_u32(s.len() as u32);
                body.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                body.put_u32(b.len() as u32);
                body.extend_from_slice(b);
            }
            Value::Bool(v) => {
                body.put_u32(1);
                body.put_u8(u8::from(*v));
            }
        }
    }

    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Append a partition-done entry to a response payload
pub fn encode_partition_done(buf: &mut BytesMut, partition: u16, result_code: u8) {
    buf.put_u32(4);
    buf.put_u8(KIND_PARTITION_DONE);
    buf.put_u16(partition);
    buf.put_u8(result_code);
}
