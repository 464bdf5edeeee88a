//! Simulation support
//!
//! In-memory cluster, scripted transports and the seeded DST harness. Nothing
//! here touches a real network, so whole scans run inside unit tests.

pub mod cluster;
pub mod dst;
pub mod node;
pub mod rng;
pub mod scripted;

pub use cluster::{SimCluster, SimConfig, SimPartitionMap, SIM_NAMESPACE};
pub use dst::{run_scan_batch, summarize_scan_batch, ScanDSTConfig, ScanDSTHarness, ScanDSTResult};
pub use node::{sim_digest, sim_ordinal, sim_record, SimFaults, SimNode, SimReply};
pub use rng::SimRng;
pub use scripted::{payload, ScriptedFrames, ScriptedResponses};
