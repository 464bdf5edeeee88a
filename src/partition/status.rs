use crate::cluster::Digest;
use serde::{Deserialize, Serialize};

/// Progress of one partition within a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// Not yet fully read
    Pending,
    /// Every record has been delivered
    Done,
    /// Node reported the partition unavailable; retried next round
    Errored,
}

/// Per-partition status plus the resume cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub id: u16,
    pub state: PartitionState,
    /// Digest of the last record delivered from this partition
    pub digest: Option<Digest>,
}

impl PartitionStatus {
    pub fn new(id: u16) -> Self {
        PartitionStatus {
            id,
            state: PartitionState::Pending,
            digest: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PartitionState::Done
    }
}
