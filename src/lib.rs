pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod observability;
pub mod partition;
pub mod pool;
pub mod protocol;
pub mod recordset;
pub mod sim;

pub use cluster::{Digest, NodeId, PartitionMap, PartitionTable};
pub use config::{BasePolicy, ClusterConfig, EngineConfig, LogConfig, PoolConfig, ScanPolicy};
pub use error::{ConfigError, ScanError};
pub use executor::{ScanExecutor, ScanHandle, ScanSummary, Transport};
pub use partition::{PartitionFilter, PartitionStatus};
pub use protocol::{Bins, Key, Record, Value};
pub use recordset::Recordset;
