//! Streaming scan commands
//!
//! ```text
//!                    ┌── DirectScanCommand ── SocketFrames ──┐
//! StreamingCommand ──┤                                       ├── decode_stream ──► Recordset
//!                    └── ProxyScanCommand ─── ProxyBridge ───┘
//! ```
//!
//! A command is created per (node, round), owns its `NodePartitions` while it
//! runs, and returns it to the executor when it exits.

pub mod bridge;
pub mod direct;
pub mod proxy;
pub mod stream;

pub use bridge::ProxyBridge;
pub use direct::{DirectScanCommand, SocketFrames};
pub use proxy::{
    ProxyRequest, ProxyResponse, ProxyScanCommand, ProxyScanRequest, ResponseStream, RpcCode,
    RpcError, ScanRpc,
};
pub use stream::{decode_stream, CommandState, FrameSource, ScanRequest, StreamOutcome};

use crate::partition::NodePartitions;

/// A command for one node and one round, bound to its transport at construction
pub enum StreamingCommand {
    Direct(DirectScanCommand),
    Proxy(ProxyScanCommand),
}

impl StreamingCommand {
    pub async fn execute(self) -> NodePartitions {
        match self {
            StreamingCommand::Direct(cmd) => cmd.execute().await,
            StreamingCommand::Proxy(cmd) => cmd.execute().await,
        }
    }
}
