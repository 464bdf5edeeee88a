//! Cluster view consumed by the scan engine
//!
//! Topology discovery and the tending loop live outside this crate. The engine
//! only needs to know which node currently owns each partition, which it reads
//! through the [`PartitionMap`] trait.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use std::fmt;

/// Identifier of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    /// Pseudo-node used when the proxy routes partitions on our behalf
    pub fn proxy() -> Self {
        NodeId("proxy".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length of a key digest in bytes
pub const DIGEST_SIZE: usize = 20;

/// 20-byte key digest. Every key maps to exactly one partition via its digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    /// Digest of a user key within a set
    pub fn of_key(set_name: &str, key: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(set_name.as_bytes());
        hasher.update(key);
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Digest(out)
    }

    /// Partition that owns this digest
    pub fn partition_id(&self, partition_count: u16) -> u16 {
        debug_assert!(partition_count > 0, "partition_count must be positive");
        u16::from_le_bytes([self.0[0], self.0[1]]) % partition_count
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Partition ownership as seen by the client.
///
/// Implemented by the cluster tending layer; `owner` must be cheap since it is
/// called once per requested partition at the start of every round.
pub trait PartitionMap: Send + Sync {
    /// Node currently owning `partition` in `namespace`, if known
    fn owner(&self, namespace: &str, partition: u16) -> Option<NodeId>;
}

/// Static ownership table, one entry per partition per namespace
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    namespaces: AHashMap<String, Vec<Option<NodeId>>>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `partition_count` partitions into contiguous equal blocks across `nodes`
    pub fn split_evenly(namespace: &str, nodes: &[NodeId], partition_count: u16) -> Self {
        let mut table = PartitionTable::new();
        if nodes.is_empty() {
            table
                .namespaces
                .insert(namespace.to_string(), vec![None; partition_count as usize]);
            return table;
        }
        let per_node = (partition_count as usize).div_ceil(nodes.len());
        let owners = (0..partition_count as usize)
            .map(|p| Some(nodes[p / per_node].clone()))
            .collect();
        table.namespaces.insert(namespace.to_string(), owners);
        table
    }

    /// Set the owner of one partition
    pub fn set_owner(&mut self, namespace: &str, partition: u16, node: Option<NodeId>) {
        let owners = self.namespaces.entry(namespace.to_string()).or_default();
        let idx = partition as usize;
        if owners.len() <= idx {
            owners.resize(idx + 1, None);
        }
        owners[idx] = node;
    }
}

impl PartitionMap for PartitionTable {
    fn owner(&self, namespace: &str, partition: u16) -> Option<NodeId> {
        self.namespaces
            .get(namespace)
            .and_then(|owners| owners.get(partition as usize))
            .cloned()
            .flatten()
    }
}
