//! Partition tracking
//!
//! Which partitions a scan targets ([`PartitionFilter`]), how they are split
//! across nodes for one round ([`NodePartitions`]), and whether the scan is
//! finished or needs another round ([`PartitionTracker`]).

pub mod filter;
pub mod node_partitions;
pub mod status;
pub mod tracker;

pub use filter::PartitionFilter;
pub use node_partitions::NodePartitions;
pub use status::{PartitionState, PartitionStatus};
pub use tracker::PartitionTracker;
