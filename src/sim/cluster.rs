//! Simulated cluster: nodes, ownership map and both transports

use super::node::{SimFaults, SimNode, SimReply};
use super::rng::SimRng;
use super::scripted::ScriptedResponses;
use crate::cluster::{NodeId, PartitionMap};
use crate::command::proxy::{ProxyRequest, ProxyResponse, ResponseStream, RpcCode, RpcError, ScanRpc};
use crate::config::PoolConfig;
use crate::error::ScanError;
use crate::pool::{BoxedStream, ConnectionPool, Connector, ProxyPool, SocketPool};
use crate::protocol::{result_code, Frame, FrameCodec, WireRequest};
use ahash::AHashMap;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// Namespace served by simulated clusters
pub const SIM_NAMESPACE: &str = "test";

/// Shape of a simulated cluster
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub node_count: usize,
    pub partition_count: u16,
    pub records_per_partition: u64,
    /// Records per response frame
    pub frame_records: usize,
    pub faults: SimFaults,
    /// Every unavailable partition moves ownership one node over
    pub migrate_on_unavailable: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            node_count: 2,
            partition_count: 4096,
            records_per_partition: 2,
            frame_records: 64,
            faults: SimFaults::default(),
            migrate_on_unavailable: false,
        }
    }
}

impl SimConfig {
    pub fn total_records(&self) -> u64 {
        u64::from(self.partition_count) * self.records_per_partition
    }
}

/// Contiguous blocks of partitions per node, shifted by the migration count
pub struct SimPartitionMap {
    nodes: Vec<NodeId>,
    partition_count: u16,
    migrations: Arc<AtomicU64>,
}

impl SimPartitionMap {
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }
}

impl PartitionMap for SimPartitionMap {
    fn owner(&self, namespace: &str, partition: u16) -> Option<NodeId> {
        if namespace != SIM_NAMESPACE || self.nodes.is_empty() || partition >= self.partition_count {
            return None;
        }
        let n = self.nodes.len();
        let base = partition as usize * n / self.partition_count as usize;
        let shift = self.migrations() as usize;
        Some(self.nodes[(base + shift) % n].clone())
    }
}

/// A set of simulated nodes plus a proxy in front of them
pub struct SimCluster {
    config: SimConfig,
    nodes: Vec<Arc<SimNode>>,
    proxy: Arc<SimNode>,
    map: Arc<SimPartitionMap>,
}

impl SimCluster {
    pub fn new(config: SimConfig, seed: u64) -> Self {
        let mut rng = SimRng::new(seed);
        let migrations = Arc::new(AtomicU64::new(0));
        let build = |id: NodeId, rng: &mut SimRng| {
            let node = SimNode::new(
                id,
                config.records_per_partition,
                config.frame_records,
                config.faults,
                rng.next_u64(),
            );
            if config.migrate_on_unavailable {
                Arc::new(node.with_migrations(migrations.clone()))
            } else {
                Arc::new(node)
            }
        };

        let nodes: Vec<Arc<SimNode>> = (0..config.node_count)
            .map(|i| build(NodeId::new(format!("node-{}", i)), &mut rng))
            .collect();
        let proxy = build(NodeId::proxy(), &mut rng);
        let map = Arc::new(SimPartitionMap {
            nodes: nodes.iter().map(|n| n.id().clone()).collect(),
            partition_count: config.partition_count,
            migrations,
        });

        SimCluster {
            config,
            nodes,
            proxy,
            map,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[Arc<SimNode>] {
        &self.nodes
    }

    pub fn proxy(&self) -> &Arc<SimNode> {
        &self.proxy
    }

    pub fn partition_map(&self) -> Arc<SimPartitionMap> {
        self.map.clone()
    }

    /// Pool whose connections are in-memory sockets served by the sim nodes
    pub fn socket_pool(&self, config: &PoolConfig) -> Arc<SocketPool> {
        let nodes = self
            .nodes
            .iter()
            .map(|n| (n.id().clone(), n.clone()))
            .collect();
        Arc::new(ConnectionPool::new(SimSocketConnector { nodes }, config))
    }

    /// Pool of RPC clients talking to the sim proxy
    pub fn proxy_pool(&self, config: &PoolConfig) -> Arc<ProxyPool> {
        Arc::new(ConnectionPool::new(
            SimProxyConnector {
                proxy: self.proxy.clone(),
            },
            config,
        ))
    }
}

/// Opens in-memory sockets to simulated nodes
pub struct SimSocketConnector {
    nodes: AHashMap<NodeId, Arc<SimNode>>,
}

impl Connector<BoxedStream> for SimSocketConnector {
    fn connect<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, ScanError>> + Send + 'a>> {
        Box::pin(async move {
            let server = self
                .nodes
                .get(node)
                .cloned()
                .ok_or_else(|| ScanError::transport(node, "connection refused", true))?;
            let (client, socket) = tokio::io::duplex(256 * 1024);
            tokio::spawn(serve_socket(server, socket));
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Serve requests on one connection until the client goes away or a drop
/// fault fires
async fn serve_socket(node: Arc<SimNode>, socket: DuplexStream) {
    let mut framed = Framed::new(socket, FrameCodec::new());
    while let Some(Ok(frame)) = framed.next().await {
        let replies = match WireRequest::decode(&frame.payload) {
            Ok(req) => node.serve(&req),
            Err(e) => {
                debug!("Sim node {} rejected request: {}", node.id(), e);
                vec![SimReply::Frame(Frame::response(
                    result_code::PARAMETER_ERROR,
                    false,
                    Bytes::new(),
                ))]
            }
        };
        for reply in replies {
            match reply {
                SimReply::Frame(frame) => {
                    if framed.send(frame).await.is_err() {
                        return;
                    }
                }
                SimReply::Drop => return,
            }
        }
    }
}

/// Hands out RPC clients for the sim proxy
pub struct SimProxyConnector {
    proxy: Arc<SimNode>,
}

impl Connector<Box<dyn ScanRpc>> for SimProxyConnector {
    fn connect<'a>(
        &'a self,
        _node: &'a NodeId,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ScanRpc>, ScanError>> + Send + 'a>> {
        let client = SimProxyClient {
            proxy: self.proxy.clone(),
        };
        Box::pin(async move { Ok(Box::new(client) as Box<dyn ScanRpc>) })
    }
}

struct SimProxyClient {
    proxy: Arc<SimNode>,
}

impl ScanRpc for SimProxyClient {
    fn scan(
        &self,
        request: ProxyRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ResponseStream>, RpcError>> + Send + '_>> {
        Box::pin(async move {
            self.proxy.record_iteration(request.iteration);
            let req = WireRequest::decode(&request.payload)
                .map_err(|e| RpcError::new(RpcCode::Internal, e.to_string()))?;
            let responses = self
                .proxy
                .serve(&req)
                .into_iter()
                .map(|reply| match reply {
                    SimReply::Frame(frame) => Ok(ProxyResponse {
                        has_next: frame.has_more,
                        status: frame.status,
                        payload: frame.payload.to_vec(),
                        compressed: frame.compressed,
                    }),
                    SimReply::Drop => Err(RpcError::new(RpcCode::Unavailable, "connection lost")),
                })
                .collect();
            Ok(Box::new(ScriptedResponses::new(responses)) as Box<dyn ResponseStream>)
        })
    }
}
