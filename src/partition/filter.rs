//! Partition Filter
//!
//! Describes which partitions a scan targets. After a scan finishes the filter
//! returned in the summary carries the per-partition cursor, so passing it to a
//! new scan resumes exactly where the previous one stopped.

use super::status::PartitionStatus;
use crate::cluster::Digest;
use crate::error::ScanError;
use serde::{Deserialize, Serialize};

/// Which partitions a scan covers, plus its resume cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter {
    begin: u16,
    /// `None` runs through the last partition of the cluster
    count: Option<u16>,
    /// Start strictly after this digest, within the digest's partition
    digest: Option<Digest>,
    /// Restrict the scan to these keys
    specific_keys: Option<Vec<Digest>>,
    /// Per-partition progress of a previous run
    pub(crate) cursor: Vec<PartitionStatus>,
    pub(crate) done: bool,
}

impl PartitionFilter {
    /// Every partition in the cluster
    pub fn all() -> Self {
        Self::with_range(0, None)
    }

    /// A single partition
    pub fn by_id(partition: u16) -> Self {
        Self::with_range(partition, Some(1))
    }

    /// Half-open range `[begin, begin + count)`
    pub fn by_range(begin: u16, count: u16) -> Self {
        Self::with_range(begin, Some(count))
    }

    /// Records of the digest's partition that sort after `digest`
    pub fn after_digest(digest: Digest) -> Self {
        PartitionFilter {
            digest: Some(digest),
            ..Self::with_range(0, Some(1))
        }
    }

    /// Only the given keys, grouped by the partitions they live in
    pub fn by_keys(keys: Vec<Digest>) -> Self {
        PartitionFilter {
            specific_keys: Some(keys),
            ..Self::with_range(0, None)
        }
    }

    fn with_range(begin: u16, count: Option<u16>) -> Self {
        PartitionFilter {
            begin,
            count,
            digest: None,
            specific_keys: None,
            cursor: Vec::new(),
            done: false,
        }
    }

    /// True once a scan using this filter read every targeted partition
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn specific_keys(&self) -> Option<&[Digest]> {
        self.specific_keys.as_deref()
    }

    /// Saved per-partition progress (empty until a scan has run)
    pub fn cursor(&self) -> &[PartitionStatus] {
        &self.cursor
    }

    /// Resolve the sorted, duplicate-free set of partition ids this filter targets
    pub fn requested_partitions(&self, partition_count: u16) -> Result<Vec<u16>, ScanError> {
        if partition_count == 0 {
            return Err(ScanError::InvalidFilter(
                "partition count must be positive".to_string(),
            ));
        }

        if let Some(keys) = &self.specific_keys {
            if keys.is_empty() {
                return Err(ScanError::InvalidFilter("empty key list".to_string()));
            }
            let mut ids: Vec<u16> = keys.iter().map(|d| d.partition_id(partition_count)).collect();
            ids.sort_unstable();
            ids.dedup();
            return Ok(ids);
        }

        if let Some(digest) = &self.digest {
            return Ok(vec![digest.partition_id(partition_count)]);
        }

        let begin = self.begin as u32;
        let total = partition_count as u32;
        if begin >= total {
            return Err(ScanError::InvalidFilter(format!(
                "begin {} outside partition space of {}",
                begin, total
            )));
        }
        let count = self.count.map(u32::from).unwrap_or(total - begin);
        if count == 0 {
            return Err(ScanError::InvalidFilter("empty partition range".to_string()));
        }
        if begin + count > total {
            return Err(ScanError::InvalidFilter(format!(
                "range [{}, {}) exceeds partition count {}",
                begin,
                begin + count,
                total
            )));
        }
        Ok((begin..begin + count).map(|p| p as u16).collect())
    }

    /// Initial resume digest for `partition`, if this filter starts mid-partition
    pub(crate) fn start_digest(&self, partition: u16, partition_count: u16) -> Option<Digest> {
        self.digest
            .filter(|d| d.partition_id(partition_count) == partition)
    }

    /// Serialize the filter and its cursor, to resume the scan elsewhere
    pub fn to_json(&self) -> Result<String, ScanError> {
        serde_json::to_string(self).map_err(|e| ScanError::InvalidFilter(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ScanError> {
        serde_json::from_str(text).map_err(|e| ScanError::InvalidFilter(e.to_string()))
    }
}
