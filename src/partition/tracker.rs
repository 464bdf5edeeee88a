//! Partition Tracker
//!
//! Owns the authoritative status of every requested partition across rounds.
//!
//! ```text
//! assign_partitions ──► [NodePartitions per node] ──► commands (one writer each)
//!        ▲                                                   │
//!        └──────── is_complete (fold + decide) ◄─────────────┘
//! ```
//!
//! Ownership is authoritative: a partition is only ever assigned to the node
//! the partition map names, never load-balanced across replicas. Partitions
//! with no known owner are deferred to the next round.

use super::filter::PartitionFilter;
use super::node_partitions::NodePartitions;
use super::status::{PartitionState, PartitionStatus};
use crate::cluster::{Digest, NodeId, PartitionMap};
use crate::config::{BasePolicy, ClusterConfig, ScanPolicy};
use crate::error::ScanError;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Tracks partition completion across retry rounds
#[derive(Debug)]
pub struct PartitionTracker {
    partition_count: u16,
    /// Master status list, sorted by id
    partitions: Vec<PartitionStatus>,
    keys: Option<Vec<Digest>>,
    filter: PartitionFilter,
    max_records: u64,
    /// Records delivered in rounds before the current one
    records_before_round: u64,
    /// Records delivered in the current round (as of the last fold)
    round_records: u64,
    iteration: u32,
    total_timeout: Option<Duration>,
    deadline: Option<Instant>,
    /// Partitions without a known owner in the current round
    deferred: Vec<u16>,
    last_error: Option<ScanError>,
    sticky_error: Option<ScanError>,
}

impl PartitionTracker {
    pub fn new(
        filter: &PartitionFilter,
        cluster: &ClusterConfig,
        policy: &ScanPolicy,
    ) -> Result<Self, ScanError> {
        let partition_count = cluster.partition_count;
        let ids = filter.requested_partitions(partition_count)?;

        let partitions = ids
            .iter()
            .map(|&id| match filter.cursor().binary_search_by_key(&id, |s| s.id) {
                Ok(idx) => filter.cursor()[idx].clone(),
                Err(_) => PartitionStatus {
                    digest: filter.start_digest(id, partition_count),
                    ..PartitionStatus::new(id)
                },
            })
            .collect();

        let total_timeout = policy.base.total_timeout();
        let tracker = PartitionTracker {
            partition_count,
            partitions,
            keys: filter.specific_keys().map(|k| k.to_vec()),
            filter: filter.clone(),
            max_records: policy.max_records,
            records_before_round: 0,
            round_records: 0,
            iteration: 0,
            total_timeout,
            deadline: total_timeout.map(|t| Instant::now() + t),
            deferred: Vec::new(),
            last_error: None,
            sticky_error: None,
        };
        tracker.verify_invariants();
        Ok(tracker)
    }

    /// Verify all invariants hold for this tracker
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        // Invariant 1: master list sorted by id without duplicates
        debug_assert!(
            self.partitions.windows(2).all(|w| w[0].id < w[1].id),
            "Invariant violated: tracker partitions unsorted or duplicated"
        );

        // Invariant 2: every id inside the partition space
        debug_assert!(
            self.partitions.iter().all(|p| p.id < self.partition_count),
            "Invariant violated: partition id outside partition space {}",
            self.partition_count
        );

        // Invariant 3: deferred ids are unfinished tracked partitions
        for id in &self.deferred {
            debug_assert!(
                self.partitions
                    .binary_search_by_key(id, |p| p.id)
                    .map(|idx| !self.partitions[idx].is_done())
                    .unwrap_or(false),
                "Invariant violated: deferred partition {} is unknown or done",
                id
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn verify_invariants(&self) {}

    /// Current round number (1 for the first round)
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Partitions that had no owner at the start of the current round
    pub fn deferred(&self) -> &[u16] {
        &self.deferred
    }

    pub fn partitions(&self) -> &[PartitionStatus] {
        &self.partitions
    }

    /// Records delivered so far
    pub fn record_count(&self) -> u64 {
        self.records_before_round + self.round_records
    }

    /// Sticky terminal error, if one was raised
    pub fn sticky_error(&self) -> Option<&ScanError> {
        self.sticky_error.as_ref()
    }

    fn begin_round(&mut self) {
        self.iteration += 1;
        self.records_before_round += self.round_records;
        self.round_records = 0;
        self.deferred.clear();
    }

    fn unfinished(&self) -> impl Iterator<Item = &PartitionStatus> {
        self.partitions.iter().filter(|p| !p.is_done())
    }

    fn records_remaining(&self) -> u64 {
        self.max_records.saturating_sub(self.records_before_round)
    }

    /// Start a new round: split unfinished partitions across their current owners.
    ///
    /// Assignments are disjoint and ordered by node id. Unowned partitions are
    /// recorded in [`deferred`](Self::deferred) and stay pending.
    pub fn assign_partitions(
        &mut self,
        namespace: &str,
        map: &dyn PartitionMap,
    ) -> Vec<NodePartitions> {
        self.begin_round();

        let mut by_node: BTreeMap<NodeId, NodePartitions> = BTreeMap::new();
        let mut owners: BTreeMap<u16, NodeId> = BTreeMap::new();
        let mut deferred = Vec::new();

        for status in self.unfinished() {
            match map.owner(namespace, status.id) {
                Some(node) => {
                    owners.insert(status.id, node.clone());
                    by_node
                        .entry(node.clone())
                        .or_insert_with(|| NodePartitions::new(node, 0))
                        .add_partition(PartitionStatus {
                            state: PartitionState::Pending,
                            ..status.clone()
                        });
                }
                None => deferred.push(status.id),
            }
        }

        if let Some(keys) = &self.keys {
            for key in keys {
                let pid = key.partition_id(self.partition_count);
                if let Some(np) = owners.get(&pid).and_then(|node| by_node.get_mut(node)) {
                    np.add_key(*key);
                }
            }
        }

        if !deferred.is_empty() {
            debug!(
                "Round {}: {} partitions have no owner, deferring",
                self.iteration,
                deferred.len()
            );
        }
        self.deferred = deferred;

        let mut assignments: Vec<NodePartitions> = by_node.into_values().collect();
        if self.max_records > 0 {
            assignments = self.split_record_cap(assignments);
        }

        for np in &assignments {
            np.verify_invariants();
        }
        self.verify_invariants();
        assignments
    }

    /// Start a new round in which one route (the proxy) serves every unfinished partition
    pub fn assign_all(&mut self, node: NodeId) -> Vec<NodePartitions> {
        self.begin_round();

        let mut np = NodePartitions::new(node, self.partitions.len());
        for status in self.unfinished() {
            np.add_partition(PartitionStatus {
                state: PartitionState::Pending,
                ..status.clone()
            });
        }
        if np.is_empty() {
            return Vec::new();
        }
        if let Some(keys) = &self.keys {
            for key in keys {
                np.add_key(*key);
            }
        }
        if self.max_records > 0 {
            np.set_records_requested(self.records_remaining());
        }
        vec![np]
    }

    /// Split the remaining record budget across nodes; nodes left with a zero
    /// share sit the round out and keep their partitions pending. The nodes
    /// receiving the remainder rotate with the round number.
    fn split_record_cap(&self, assignments: Vec<NodePartitions>) -> Vec<NodePartitions> {
        let remaining = self.records_remaining();
        let nodes = assignments.len() as u64;
        if nodes == 0 {
            return assignments;
        }
        let per_node = remaining / nodes;
        let extra = remaining % nodes;
        let offset = u64::from(self.iteration.saturating_sub(1)) % nodes;

        assignments
            .into_iter()
            .enumerate()
            .filter_map(|(i, mut np)| {
                let slot = (i as u64 + nodes - offset) % nodes;
                let share = per_node + u64::from(slot < extra);
                if share == 0 {
                    return None;
                }
                np.set_records_requested(share);
                Some(np)
            })
            .collect()
    }

    /// Fold a finished round back into the master list and decide completion.
    ///
    /// Returns `Ok(true)` when every partition is done, or the record cap was
    /// reached, or a capped round ended with nothing unavailable, or
    /// `allow_partial` is set and only unavailable partitions remain. A capped
    /// scan that stops early leaves the filter resumable.
    /// Returns the first fatal error (sticky, command-reported, retry budget or
    /// total deadline). Retryable per-partition failures return `Ok(false)`
    /// and leave those partitions pending for the next round.
    ///
    /// Calling this again with the same assignments yields the same answer.
    pub fn is_complete(
        &mut self,
        allow_partial: bool,
        policy: &BasePolicy,
        assignments: &[NodePartitions],
    ) -> Result<bool, ScanError> {
        if let Some(err) = &self.sticky_error {
            return Err(err.clone());
        }

        let mut round_records = 0u64;
        let mut round_failed = !self.deferred.is_empty();
        let mut fatal: Option<ScanError> = None;
        for np in assignments {
            round_records += np.record_count();
            if np.parts_unavailable() > 0 || np.error().is_some() {
                round_failed = true;
            }
            for status in np.partitions() {
                if let Ok(idx) = self.partitions.binary_search_by_key(&status.id, |p| p.id) {
                    let master = &mut self.partitions[idx];
                    if !master.is_done() {
                        *master = status.clone();
                    }
                }
            }
            if let Some(err) = np.error() {
                if err.is_retryable() {
                    self.last_error = Some(err.clone());
                } else if fatal.is_none() {
                    fatal = Some(err.clone());
                }
            }
        }
        self.round_records = round_records;
        self.verify_invariants();

        if let Some(err) = fatal {
            return Err(err);
        }

        if self.unfinished().next().is_none() {
            self.filter.done = true;
            return Ok(true);
        }

        if self.max_records > 0 && (self.record_count() >= self.max_records || !round_failed) {
            return Ok(true);
        }

        if allow_partial
            && self
                .unfinished()
                .all(|p| p.state == PartitionState::Errored)
        {
            return Ok(true);
        }

        if self.iteration > policy.max_retries {
            return Err(ScanError::MaxRetriesExceeded {
                retries: policy.max_retries,
                last: self.last_error.clone().map(Box::new),
            });
        }

        if let (Some(deadline), Some(total)) = (self.deadline, self.total_timeout) {
            if Instant::now() >= deadline {
                return Err(ScanError::TotalTimeout(total));
            }
        }

        Ok(false)
    }

    /// Make `err` the terminal outcome regardless of partitions already completed
    pub fn partition_error(&mut self, err: ScanError) {
        if self.sticky_error.is_none() {
            self.sticky_error = Some(err);
        }
    }

    /// Time left before the total deadline, if one is set
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Filter carrying the current cursor, usable to resume the scan
    pub fn to_filter(&self) -> PartitionFilter {
        let mut filter = self.filter.clone();
        filter.cursor = self.partitions.clone();
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PartitionTable;
    use std::collections::BTreeSet;

    fn tracker(filter: PartitionFilter) -> PartitionTracker {
        PartitionTracker::new(&filter, &ClusterConfig::default(), &ScanPolicy::test()).unwrap()
    }

    fn two_nodes() -> PartitionTable {
        PartitionTable::split_evenly("test", &[NodeId::new("A"), NodeId::new("B")], 4096)
    }

    fn finish_all(assignments: &mut [NodePartitions]) {
        for np in assignments.iter_mut() {
            np.finish_stream();
        }
    }

    #[test]
    fn test_assignment_union_is_exact_and_disjoint() {
        for (begin, count) in [(0u16, 4096u16), (0, 1), (100, 37), (2040, 16), (4095, 1)] {
            let mut t = tracker(PartitionFilter::by_range(begin, count));
            let assignments = t.assign_partitions("test", &two_nodes());

            let mut seen = BTreeSet::new();
            let mut total = 0;
            for np in &assignments {
                for id in np.partition_ids() {
                    seen.insert(id);
                    total += 1;
                }
            }
            assert_eq!(total, seen.len(), "duplicate partition in [{}, +{})", begin, count);
            let expected: BTreeSet<u16> = (begin..begin + count).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_assignment_follows_ownership() {
        let mut t = tracker(PartitionFilter::all());
        let assignments = t.assign_partitions("test", &two_nodes());
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].node(), &NodeId::new("A"));
        assert_eq!(assignments[0].len(), 2048);
        assert_eq!(assignments[1].node(), &NodeId::new("B"));
        assert!(assignments[1].partition_ids().all(|id| id >= 2048));
    }

    #[test]
    fn test_unowned_partitions_are_deferred() {
        let mut map = two_nodes();
        map.set_owner("test", 5, None);
        let mut t = tracker(PartitionFilter::by_range(0, 10));
        let mut assignments = t.assign_partitions("test", &map);
        assert_eq!(t.deferred(), &[5]);
        assert_eq!(assignments[0].len(), 9);

        finish_all(&mut assignments);
        assert!(!t.is_complete(false, &BasePolicy::test(), &assignments).unwrap());

        map.set_owner("test", 5, Some(NodeId::new("B")));
        let mut retry = t.assign_partitions("test", &map);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].partition_ids().collect::<Vec<_>>(), vec![5]);
        finish_all(&mut retry);
        assert!(t.is_complete(false, &BasePolicy::test(), &retry).unwrap());
        assert!(t.to_filter().is_done());
    }

    #[test]
    fn test_is_complete_idempotent() {
        let mut t = tracker(PartitionFilter::all());
        let mut assignments = t.assign_partitions("test", &two_nodes());
        finish_all(&mut assignments);
        let policy = BasePolicy::test();
        assert_eq!(t.is_complete(false, &policy, &assignments), Ok(true));
        assert_eq!(t.is_complete(false, &policy, &assignments), Ok(true));
        assert!(t.sticky_error().is_none());

        let mut t = tracker(PartitionFilter::by_range(0, 4));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        assignments[0].mark_unavailable(2);
        finish_all(&mut assignments);
        assert_eq!(t.is_complete(false, &policy, &assignments), Ok(false));
        assert_eq!(t.is_complete(false, &policy, &assignments), Ok(false));
        assert_eq!(t.record_count(), 0);
    }

    #[test]
    fn test_unavailable_partitions_retry_with_cursor() {
        let mut t = tracker(PartitionFilter::by_range(0, 3));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        let np = &mut assignments[0];
        np.record_received(1, Digest([3; 20]));
        np.mark_unavailable(1);
        np.finish_stream();

        assert_eq!(t.is_complete(false, &BasePolicy::test(), &assignments), Ok(false));
        let retry = t.assign_partitions("test", &two_nodes());
        assert_eq!(t.iteration(), 2);
        assert_eq!(
            retry[0].partial_partitions().collect::<Vec<_>>(),
            vec![(1, Digest([3; 20]))]
        );
        assert_eq!(retry[0].partitions()[0].state, PartitionState::Pending);
    }

    #[test]
    fn test_allow_partial_accepts_unavailable() {
        let mut t = tracker(PartitionFilter::by_range(0, 3));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        assignments[0].mark_unavailable(0);
        finish_all(&mut assignments);
        assert_eq!(t.is_complete(true, &BasePolicy::test(), &assignments), Ok(true));
        assert!(!t.to_filter().is_done());
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut policy = BasePolicy::test();
        policy.max_retries = 1;
        let mut t = tracker(PartitionFilter::by_id(0));
        for round in 1..=2 {
            let mut assignments = t.assign_partitions("test", &two_nodes());
            assignments[0].set_error(ScanError::transport(&NodeId::new("A"), "reset", true));
            let result = t.is_complete(false, &policy, &assignments);
            if round == 1 {
                assert_eq!(result, Ok(false));
            } else {
                match result {
                    Err(ScanError::MaxRetriesExceeded { retries, last }) => {
                        assert_eq!(retries, 1);
                        assert!(last.is_some());
                    }
                    other => panic!("expected max retries, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_fatal_command_error_surfaces() {
        let mut t = tracker(PartitionFilter::by_range(0, 4));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        let fatal = ScanError::Server {
            node: NodeId::new("A"),
            code: 1,
        };
        assignments[0].set_error(fatal.clone());
        assert_eq!(t.is_complete(false, &BasePolicy::test(), &assignments), Err(fatal));
    }

    #[test]
    fn test_partition_error_is_sticky() {
        let mut t = tracker(PartitionFilter::by_range(0, 2));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        finish_all(&mut assignments);
        let err = ScanError::MaxRetriesExceeded {
            retries: 0,
            last: None,
        };
        t.partition_error(err.clone());
        assert_eq!(t.is_complete(false, &BasePolicy::test(), &assignments), Err(err.clone()));
        assert_eq!(t.is_complete(false, &BasePolicy::test(), &assignments), Err(err));
    }

    #[test]
    fn test_record_cap_split_across_nodes() {
        let mut policy = ScanPolicy::test();
        policy.max_records = 5;
        let mut t =
            PartitionTracker::new(&PartitionFilter::all(), &ClusterConfig::default(), &policy)
                .unwrap();
        let assignments = t.assign_partitions("test", &two_nodes());
        let shares: Vec<u64> = assignments.iter().map(|np| np.records_requested()).collect();
        assert_eq!(shares, vec![3, 2]);

        policy.max_records = 1;
        let mut t =
            PartitionTracker::new(&PartitionFilter::all(), &ClusterConfig::default(), &policy)
                .unwrap();
        let assignments = t.assign_partitions("test", &two_nodes());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].records_requested(), 1);
    }

    #[test]
    fn test_record_cap_remainder_rotates() {
        let mut policy = ScanPolicy::test();
        policy.max_records = 1;
        let mut t =
            PartitionTracker::new(&PartitionFilter::all(), &ClusterConfig::default(), &policy)
                .unwrap();
        let mut first = t.assign_partitions("test", &two_nodes());
        assert_eq!(first[0].node(), &NodeId::new("A"));
        first[0].mark_unavailable(0);
        first[0].finish_stream();
        assert_eq!(t.is_complete(false, &policy.base, &first), Ok(false));

        let second = t.assign_partitions("test", &two_nodes());
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].node(), &NodeId::new("B"));
    }

    #[test]
    fn test_capped_round_without_failures_is_complete() {
        let mut policy = ScanPolicy::test();
        policy.max_records = 1;
        policy.base.max_retries = 0;
        let nodes: Vec<NodeId> = (0..8).map(|i| NodeId::new(format!("n{}", i))).collect();
        let map = PartitionTable::split_evenly("test", &nodes, 4096);
        let mut t =
            PartitionTracker::new(&PartitionFilter::all(), &ClusterConfig::default(), &policy)
                .unwrap();

        // Seven nodes sit out with a zero share; the eighth finds nothing.
        let mut assignments = t.assign_partitions("test", &map);
        assert_eq!(assignments.len(), 1);
        finish_all(&mut assignments);

        assert_eq!(t.is_complete(false, &policy.base, &assignments), Ok(true));
        assert_eq!(t.record_count(), 0);
        let filter = t.to_filter();
        assert!(!filter.is_done());
        assert_eq!(filter.cursor().iter().filter(|p| p.is_done()).count(), 512);
    }

    #[test]
    fn test_resume_from_saved_cursor() {
        let mut t = tracker(PartitionFilter::by_range(0, 2));
        let mut assignments = t.assign_partitions("test", &two_nodes());
        assignments[0].record_received(0, Digest([1; 20]));
        assignments[0].mark_done(0);
        assignments[0].record_received(1, Digest([2; 20]));
        t.is_complete(false, &BasePolicy::test(), &assignments).unwrap();

        let saved = t.to_filter();
        let json = serde_json::to_string(&saved).unwrap();
        let restored: PartitionFilter = serde_json::from_str(&json).unwrap();

        let mut resumed = tracker(restored);
        let assignments = resumed.assign_partitions("test", &two_nodes());
        assert_eq!(assignments.len(), 1);
        assert_eq!(
            assignments[0].partial_partitions().collect::<Vec<_>>(),
            vec![(1, Digest([2; 20]))]
        );
    }

    #[test]
    fn test_proxy_assignment_covers_everything() {
        let mut t = tracker(PartitionFilter::all());
        let assignments = t.assign_all(NodeId::proxy());
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].len(), 4096);
    }

    #[test]
    fn test_keys_routed_to_owner() {
        let keys: Vec<Digest> = (0..20u32)
            .map(|i| Digest::of_key("s", &i.to_be_bytes()))
            .collect();
        let mut t = tracker(PartitionFilter::by_keys(keys.clone()));
        let assignments = t.assign_partitions("test", &two_nodes());
        let routed: usize = assignments.iter().map(|np| np.keys().len()).sum();
        assert_eq!(routed, keys.len());
        for np in &assignments {
            for key in np.keys() {
                let pid = key.partition_id(4096);
                assert!(np.partition_ids().any(|id| id == pid));
            }
        }
    }
}
