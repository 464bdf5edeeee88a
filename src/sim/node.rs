//! Simulated storage node
//!
//! Every partition holds `records_per_partition` records. Record `n` of
//! partition `p` has the digest
//!
//! ```text
//! [p: u16 LE][n: u64 BE][0 × 10]
//! ```
//!
//! so digests route back to their partition and sort by ordinal, which is what
//! the resume-after-digest logic of the server relies on.

use super::rng::SimRng;
use crate::cluster::{Digest, NodeId, DIGEST_SIZE};
use crate::protocol::record::{encode_partition_done, encode_record};
use crate::protocol::{result_code, Bins, Frame, Key, Record, Value, WireRequest};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fault injection knobs
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimFaults {
    /// Chance a partition is reported unavailable (e.g. migrating)
    pub unavailable_probability: f64,
    /// Chance the connection drops after each frame
    pub drop_probability: f64,
}

/// One step of a simulated response
#[derive(Debug, Clone, PartialEq)]
pub enum SimReply {
    Frame(Frame),
    /// Connection lost
    Drop,
}

/// Digest of record `ordinal` in `partition`
pub fn sim_digest(partition: u16, ordinal: u64) -> Digest {
    let mut d = [0u8; DIGEST_SIZE];
    d[..2].copy_from_slice(&partition.to_le_bytes());
    d[2..10].copy_from_slice(&ordinal.to_be_bytes());
    Digest(d)
}

/// Ordinal encoded in a simulated digest
pub fn sim_ordinal(digest: &Digest) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&digest.0[2..10]);
    u64::from_be_bytes(b)
}

/// Record `ordinal` of `partition`
pub fn sim_record(namespace: &str, partition: u16, ordinal: u64) -> Record {
    let mut bins = Bins::new();
    bins.insert("partition".to_string(), Value::Int(i64::from(partition)));
    bins.insert("ordinal".to_string(), Value::Int(ordinal as i64));
    Record {
        key: Key {
            namespace: Arc::from(namespace),
            set_name: Some("sim".to_string()),
            digest: sim_digest(partition, ordinal),
        },
        bins,
        generation: 1,
        expiration: 0,
    }
}

/// Server side of one node
pub struct SimNode {
    id: NodeId,
    records_per_partition: u64,
    frame_records: usize,
    faults: SimFaults,
    rng: Mutex<SimRng>,
    /// Bumped whenever this node reports a partition unavailable
    migrations: Option<Arc<AtomicU64>>,
    requests: AtomicU64,
    iterations: Mutex<Vec<u32>>,
}

impl SimNode {
    pub fn new(
        id: NodeId,
        records_per_partition: u64,
        frame_records: usize,
        faults: SimFaults,
        seed: u64,
    ) -> Self {
        SimNode {
            id,
            records_per_partition,
            frame_records: frame_records.max(1),
            faults,
            rng: Mutex::new(SimRng::new(seed)),
            migrations: None,
            requests: AtomicU64::new(0),
            iterations: Mutex::new(Vec::new()),
        }
    }

    /// Report unavailable partitions as migrations on this counter
    pub fn with_migrations(mut self, migrations: Arc<AtomicU64>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Requests served so far
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Proxy iterations seen, in arrival order
    pub fn iterations(&self) -> Vec<u32> {
        self.iterations.lock().clone()
    }

    pub(crate) fn record_iteration(&self, iteration: u32) {
        self.iterations.lock().push(iteration);
    }

    /// Build the response to one request
    pub fn serve(&self, req: &WireRequest) -> Vec<SimReply> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut rng = self.rng.lock();

        let mut work: Vec<(u16, u64)> = req.partitions.iter().map(|p| (*p, 0)).collect();
        work.extend(req.resume.iter().map(|(p, d)| (*p, sim_ordinal(d) + 1)));
        work.sort_unstable();

        let keys: Option<HashSet<Digest>> =
            (!req.keys.is_empty()).then(|| req.keys.iter().copied().collect());

        let mut replies = Vec::new();
        let mut buf = BytesMut::new();
        let mut in_frame = 0usize;
        let mut sent = 0u64;

        'partitions: for (partition, start) in work {
            if rng.gen_bool(self.faults.unavailable_probability) {
                encode_partition_done(&mut buf, partition, result_code::PARTITION_UNAVAILABLE);
                if let Some(migrations) = &self.migrations {
                    migrations.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }

            for ordinal in start..self.records_per_partition {
                if req.max_records > 0 && sent >= req.max_records {
                    break 'partitions;
                }
                let record = sim_record(&req.namespace, partition, ordinal);
                if let Some(keys) = &keys {
                    if !keys.contains(&record.key.digest) {
                        continue;
                    }
                }
                if encode_record(&mut buf, partition, &record).is_err() {
                    replies.push(SimReply::Frame(Frame::response(
                        result_code::SERVER_ERROR,
                        false,
                        buf.split().freeze(),
                    )));
                    return replies;
                }
                sent += 1;
                in_frame += 1;

                if in_frame >= self.frame_records {
                    replies.push(SimReply::Frame(self.frame(req, true, &mut buf)));
                    in_frame = 0;
                    if rng.gen_bool(self.faults.drop_probability) {
                        replies.push(SimReply::Drop);
                        return replies;
                    }
                }
            }

            if req.max_records > 0 && sent >= req.max_records {
                break;
            }
            encode_partition_done(&mut buf, partition, result_code::OK);
        }

        replies.push(SimReply::Frame(self.frame(req, false, &mut buf)));
        replies
    }

    fn frame(&self, req: &WireRequest, has_more: bool, buf: &mut BytesMut) -> Frame {
        let frame = Frame::response(result_code::OK, has_more, buf.split().freeze());
        if req.compress_response {
            return compress(frame);
        }
        frame
    }
}

#[cfg(feature = "compression")]
fn compress(frame: Frame) -> Frame {
    match frame.clone().compress(1) {
        Ok(packed) => packed,
        Err(_) => frame,
    }
}

#[cfg(not(feature = "compression"))]
fn compress(frame: Frame) -> Frame {
    frame
}
