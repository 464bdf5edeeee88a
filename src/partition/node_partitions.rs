//! Per-node partition assignment for one round
//!
//! A `NodePartitions` is moved into the command that owns it, mutated only by
//! that command while the stream is decoded, and handed back to the tracker
//! when the command exits.

use super::status::{PartitionState, PartitionStatus};
use crate::cluster::{Digest, NodeId};
use crate::error::ScanError;

/// Partitions assigned to one node for one round
#[derive(Debug, Clone)]
pub struct NodePartitions {
    node: NodeId,
    /// Sorted by partition id
    partitions: Vec<PartitionStatus>,
    /// Key digests to restrict the scan to, if the filter named keys
    keys: Vec<Digest>,
    record_count: u64,
    /// Record cap for this node; zero means unlimited
    records_requested: u64,
    parts_unavailable: usize,
    error: Option<ScanError>,
}

impl NodePartitions {
    pub fn new(node: NodeId, capacity: usize) -> Self {
        NodePartitions {
            node,
            partitions: Vec::with_capacity(capacity),
            keys: Vec::new(),
            record_count: 0,
            records_requested: 0,
            parts_unavailable: 0,
            error: None,
        }
    }

    /// Verify all invariants hold for this assignment
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        // Invariant 1: partition ids are strictly increasing (sorted, no duplicates)
        debug_assert!(
            self.partitions.windows(2).all(|w| w[0].id < w[1].id),
            "Invariant violated: node {} has unsorted or duplicate partitions",
            self.node
        );

        // Invariant 2: unavailable count matches errored partitions
        let errored = self
            .partitions
            .iter()
            .filter(|p| p.state == PartitionState::Errored)
            .count();
        debug_assert_eq!(
            errored, self.parts_unavailable,
            "Invariant violated: node {} parts_unavailable {} != errored {}",
            self.node, self.parts_unavailable, errored
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn verify_invariants(&self) {}

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Add a partition; ids must be added in increasing order
    pub(crate) fn add_partition(&mut self, status: PartitionStatus) {
        debug_assert!(
            self.partitions.last().map_or(true, |last| last.id < status.id),
            "partitions must be added in increasing id order"
        );
        self.partitions.push(status);
    }

    pub(crate) fn add_key(&mut self, digest: Digest) {
        self.keys.push(digest);
    }

    pub(crate) fn set_records_requested(&mut self, records: u64) {
        self.records_requested = records;
    }

    pub fn partitions(&self) -> &[PartitionStatus] {
        &self.partitions
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.partitions.iter().map(|p| p.id)
    }

    /// Partitions to read from the start
    pub fn full_partitions(&self) -> impl Iterator<Item = u16> + '_ {
        self.partitions
            .iter()
            .filter(|p| p.digest.is_none())
            .map(|p| p.id)
    }

    /// Partitions to resume after their last delivered digest
    pub fn partial_partitions(&self) -> impl Iterator<Item = (u16, Digest)> + '_ {
        self.partitions
            .iter()
            .filter_map(|p| p.digest.map(|d| (p.id, d)))
    }

    pub fn keys(&self) -> &[Digest] {
        &self.keys
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn records_requested(&self) -> u64 {
        self.records_requested
    }

    pub fn parts_unavailable(&self) -> usize {
        self.parts_unavailable
    }

    pub fn error(&self) -> Option<&ScanError> {
        self.error.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    fn status_mut(&mut self, partition: u16) -> Option<&mut PartitionStatus> {
        self.partitions
            .binary_search_by_key(&partition, |p| p.id)
            .ok()
            .map(|idx| &mut self.partitions[idx])
    }

    /// Record delivered: advance the partition's resume cursor.
    /// Returns false if the partition is not assigned to this node.
    pub fn record_received(&mut self, partition: u16, digest: Digest) -> bool {
        match self.status_mut(partition) {
            Some(status) => {
                status.digest = Some(digest);
                self.record_count += 1;
                true
            }
            None => false,
        }
    }

    /// Server finished the partition
    pub fn mark_done(&mut self, partition: u16) {
        let mut was_errored = false;
        if let Some(status) = self.status_mut(partition) {
            was_errored = status.state == PartitionState::Errored;
            status.state = PartitionState::Done;
        }
        if was_errored {
            self.parts_unavailable -= 1;
        }
    }

    /// Whether the partition is assigned to this node
    pub fn contains(&self, partition: u16) -> bool {
        self.partitions
            .binary_search_by_key(&partition, |p| p.id)
            .is_ok()
    }

    /// Server could not serve the partition (e.g. migrating); retried next round
    pub fn mark_unavailable(&mut self, partition: u16) {
        let mut newly = false;
        if let Some(status) = self.status_mut(partition) {
            if status.state != PartitionState::Errored {
                status.state = PartitionState::Errored;
                newly = true;
            }
        }
        if newly {
            self.parts_unavailable += 1;
        }
    }

    /// Whether the server stopped because this node's record cap was reached
    pub fn reached_record_cap(&self) -> bool {
        self.records_requested > 0 && self.record_count >= self.records_requested
    }

    /// Clean end of stream: partitions still pending are complete,
    /// unless the stream stopped early at the record cap.
    pub fn finish_stream(&mut self) {
        if self.reached_record_cap() {
            return;
        }
        for status in &mut self.partitions {
            if status.state == PartitionState::Pending {
                status.state = PartitionState::Done;
            }
        }
    }

    /// Record the error that ended this node's stream. The first one wins.
    pub fn set_error(&mut self, err: ScanError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}
