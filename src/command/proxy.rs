//! Proxy transport
//!
//! The encoded request travels inside one streaming-RPC call. The proxy routes
//! partitions to nodes itself, so a proxy command always covers every
//! unfinished partition of the round.

use super::bridge::ProxyBridge;
use super::stream::{decode_stream, read_limit, report_failure, CommandState, ScanRequest};
use crate::cluster::NodeId;
use crate::config::ScanPolicy;
use crate::error::ScanError;
use crate::partition::{NodePartitions, PartitionFilter};
use crate::pool::ProxyPool;
use crate::recordset::ProducerGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Scan fields the proxy needs to route the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyScanRequest {
    pub namespace: String,
    pub set_name: Option<String>,
    pub bin_names: Vec<String>,
    pub partition_filter: PartitionFilter,
    pub policy: ScanPolicy,
}

/// Outbound RPC envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Correlation id
    pub id: u32,
    /// Round number of the operation
    pub iteration: u32,
    /// Encoded wire request
    pub payload: Vec<u8>,
    pub scan_request: ProxyScanRequest,
}

/// Inbound RPC envelope, one per response chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub has_next: bool,
    pub status: u8,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub compressed: bool,
}

impl ProxyResponse {
    pub fn new(status: u8, has_next: bool, payload: Vec<u8>) -> Self {
        ProxyResponse {
            has_next,
            status,
            payload,
            compressed: false,
        }
    }
}

/// RPC status codes the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCode {
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    ResourceExhausted,
    Internal,
    Unknown,
}

/// Failure reported by the RPC layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    /// Same classification as the socket path: deadline expiry is a timeout,
    /// cancellation is never retried, everything else is a transport failure.
    pub fn into_scan_error(self, node: &NodeId, read_only: bool) -> ScanError {
        match self.code {
            RpcCode::DeadlineExceeded => ScanError::Timeout {
                node: node.clone(),
                retryable: read_only,
            },
            RpcCode::Cancelled => ScanError::transport(node, self.to_string(), false),
            _ => ScanError::transport(node, self.to_string(), read_only),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc {:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Stream of response chunks for one RPC call
pub trait ResponseStream: Send {
    /// Next chunk, or `None` once the server closed the stream
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProxyResponse>, RpcError>> + Send + '_>>;
}

/// Proxy client able to start streaming scans
pub trait ScanRpc: Send + Sync {
    fn scan(
        &self,
        request: ProxyRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ResponseStream>, RpcError>> + Send + '_>>;
}

/// One round of a scan through the proxy
pub struct ProxyScanCommand {
    pool: Arc<ProxyPool>,
    request: Arc<ScanRequest>,
    filter: PartitionFilter,
    iteration: u32,
    partitions: NodePartitions,
    producer: ProducerGuard,
    deadline: Option<Instant>,
    state: CommandState,
}

impl ProxyScanCommand {
    pub fn new(
        pool: Arc<ProxyPool>,
        request: Arc<ScanRequest>,
        filter: PartitionFilter,
        iteration: u32,
        partitions: NodePartitions,
        producer: ProducerGuard,
        deadline: Option<Instant>,
    ) -> Self {
        ProxyScanCommand {
            pool,
            request,
            filter,
            iteration,
            partitions,
            producer,
            deadline,
            state: CommandState::Created,
        }
    }

    fn transition(&mut self, next: CommandState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal command transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn envelope(&self) -> Result<ProxyRequest, ScanError> {
        let mut buf = self.pool.buffers().acquire();
        let encoded = self.request.wire_request(&self.partitions).encode(&mut buf);
        let payload = buf.to_vec();
        self.pool.buffers().release(buf);
        encoded?;

        Ok(ProxyRequest {
            id: rand::random(),
            iteration: self.iteration,
            payload,
            scan_request: ProxyScanRequest {
                namespace: self.request.namespace.to_string(),
                set_name: self.request.set_name.clone(),
                bin_names: self.request.bin_names.clone(),
                partition_filter: self.filter.clone(),
                policy: self.request.policy.clone(),
            },
        })
    }

    /// Run the round against the proxy and hand back the updated assignment
    pub async fn execute(mut self) -> NodePartitions {
        let node = self.partitions.node().clone();
        let read_only = self.request.read_only;
        debug!(
            "Proxy scan round {}: {} partitions",
            self.iteration,
            self.partitions.len()
        );

        self.transition(CommandState::Sending);
        let mut client = match self.pool.acquire(&node).await {
            Ok(client) => client,
            Err(err) => {
                report_failure(&mut self.partitions, &self.producer, err).await;
                self.transition(CommandState::Errored);
                return self.partitions;
            }
        };

        let envelope = match self.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                report_failure(&mut self.partitions, &self.producer, err).await;
                self.transition(CommandState::Errored);
                return self.partitions;
            }
        };

        let socket_timeout = self.request.policy.base.socket_timeout();
        let started = match read_limit(socket_timeout, self.deadline) {
            Some(limit) => tokio::time::timeout(limit, client.scan(envelope))
                .await
                .unwrap_or_else(|_| Err(RpcError::new(RpcCode::DeadlineExceeded, "scan call"))),
            None => client.scan(envelope).await,
        };
        let stream = match started {
            Ok(stream) => stream,
            Err(err) => {
                client.mark_broken();
                let err = err.into_scan_error(&node, read_only);
                report_failure(&mut self.partitions, &self.producer, err).await;
                self.transition(CommandState::Errored);
                return self.partitions;
            }
        };

        self.transition(CommandState::Streaming);
        let mut bridge = ProxyBridge::new(stream, node, read_only, socket_timeout, self.deadline);
        let outcome =
            decode_stream(&mut bridge, &self.request, &mut self.partitions, &self.producer).await;
        if outcome.state() != CommandState::Completed {
            client.mark_broken();
        }
        self.transition(outcome.state());
        self.partitions
    }
}
