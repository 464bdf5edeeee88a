//! Direct socket transport
//!
//! One pooled connection per command. The request goes out as a single frame;
//! response frames are read from the same connection until the final one.

use super::stream::{decode_stream, read_limit, report_failure, CommandState, FrameSource, ScanRequest};
use crate::cluster::NodeId;
use crate::error::ScanError;
use crate::partition::NodePartitions;
use crate::pool::{BoxedStream, SocketPool};
use crate::protocol::{Frame, FrameCodec};
use crate::recordset::ProducerGuard;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;

/// Frames read from a socket, each read bounded by the socket timeout and
/// the operation deadline
pub struct SocketFrames<'a> {
    framed: Framed<&'a mut BoxedStream, FrameCodec>,
    node: NodeId,
    read_only: bool,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl<'a> SocketFrames<'a> {
    pub fn new(
        stream: &'a mut BoxedStream,
        node: NodeId,
        read_only: bool,
        socket_timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Self {
        SocketFrames {
            framed: Framed::new(stream, FrameCodec::new()),
            node,
            read_only,
            socket_timeout,
            deadline,
        }
    }

    fn timeout_error(&self) -> ScanError {
        ScanError::Timeout {
            node: self.node.clone(),
            retryable: self.read_only,
        }
    }

    pub async fn send_request(&mut self, payload: Bytes) -> Result<(), ScanError> {
        let send = self.framed.send(Frame::request(payload));
        let sent = match read_limit(self.socket_timeout, self.deadline) {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(sent) => sent,
                Err(_) => return Err(self.timeout_error()),
            },
            None => send.await,
        };
        sent.map_err(|e| ScanError::from_io(&self.node, e, self.read_only))
    }

    async fn read(&mut self) -> Result<Option<Frame>, ScanError> {
        let next = match read_limit(self.socket_timeout, self.deadline) {
            Some(limit) => match tokio::time::timeout(limit, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => return Err(self.timeout_error()),
            },
            None => self.framed.next().await,
        };
        match next {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(ScanError::from_io(&self.node, e, self.read_only)),
            None => Err(ScanError::transport(
                &self.node,
                "connection closed mid-stream",
                self.read_only,
            )),
        }
    }
}

impl FrameSource for SocketFrames<'_> {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, ScanError>> + Send + '_>> {
        Box::pin(self.read())
    }
}

/// One round of a scan against one node over a direct connection
pub struct DirectScanCommand {
    pool: Arc<SocketPool>,
    request: Arc<ScanRequest>,
    partitions: NodePartitions,
    producer: ProducerGuard,
    deadline: Option<Instant>,
    state: CommandState,
}

impl DirectScanCommand {
    pub fn new(
        pool: Arc<SocketPool>,
        request: Arc<ScanRequest>,
        partitions: NodePartitions,
        producer: ProducerGuard,
        deadline: Option<Instant>,
    ) -> Self {
        DirectScanCommand {
            pool,
            request,
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

    fn encode(&self) -> Result<Bytes, ScanError> {
        let mut buf = self.pool.buffers().acquire();
        let encoded = self.request.wire_request(&self.partitions).encode(&mut buf);
        let payload = Bytes::copy_from_slice(&buf);
        self.pool.buffers().release(buf);
        encoded.map(|_| payload)
    }

    /// Run the command and hand back the updated assignment. The connection
    /// goes back to the pool on every path; it is discarded unless the stream
    /// completed cleanly.
    pub async fn execute(mut self) -> NodePartitions {
        let node = self.partitions.node().clone();
        debug!(
            "Scanning {} partitions on node {}",
            self.partitions.len(),
            node
        );

        self.transition(CommandState::Sending);
        let mut conn = match self.pool.acquire(&node).await {
            Ok(conn) => conn,
            Err(err) => {
                report_failure(&mut self.partitions, &self.producer, err).await;
                self.transition(CommandState::Errored);
                return self.partitions;
            }
        };

        let outcome = match self.encode() {
            Err(err) => report_failure(&mut self.partitions, &self.producer, err).await,
            Ok(payload) => {
                let mut frames = SocketFrames::new(
                    &mut conn,
                    node.clone(),
                    self.request.read_only,
                    self.request.policy.base.socket_timeout(),
                    self.deadline,
                );
                match frames.send_request(payload).await {
                    Err(err) => report_failure(&mut self.partitions, &self.producer, err).await,
                    Ok(()) => {
                        self.transition(CommandState::Streaming);
                        decode_stream(&mut frames, &self.request, &mut self.partitions, &self.producer)
                            .await
                    }
                }
            }
        };

        if outcome.state() != CommandState::Completed {
            conn.mark_broken();
        }
        self.transition(outcome.state());
        debug!(
            "Node {} command finished: {:?}, {} records",
            node,
            self.state,
            self.partitions.record_count()
        );
        self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ScanPolicy};
    use crate::partition::PartitionStatus;
    use crate::pool::{ConnectionPool, Connector};
    use crate::protocol::WireRequest;
    use crate::recordset;
    use crate::sim::scripted::payload;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Encoder;

    /// Hands out prepared in-memory streams
    struct Prepared(Mutex<Vec<BoxedStream>>);

    impl Connector<BoxedStream> for Prepared {
        fn connect<'a>(
            &'a self,
            node: &'a NodeId,
        ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, ScanError>> + Send + 'a>> {
            Box::pin(async move {
                self.0
                    .lock()
                    .pop()
                    .ok_or_else(|| ScanError::transport(node, "connection refused", true))
            })
        }
    }

    fn pool_with(streams: Vec<BoxedStream>) -> Arc<SocketPool> {
        Arc::new(ConnectionPool::new(
            Prepared(Mutex::new(streams)),
            &PoolConfig::default(),
        ))
    }

    fn assignment(ids: &[u16]) -> NodePartitions {
        let mut np = NodePartitions::new(NodeId::new("A"), ids.len());
        for id in ids {
            np.add_partition(PartitionStatus::new(*id));
        }
        np
    }

    fn request() -> Arc<ScanRequest> {
        Arc::new(ScanRequest::new("test", None, &[], ScanPolicy::test(), 5))
    }

    fn encode_frames(frames: Vec<Frame>) -> Vec<u8> {
        let mut codec = FrameCodec::new();
        let mut buf = bytes::BytesMut::new();
        for frame in frames {
            codec.encode(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_scan_over_socket() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let pool = pool_with(vec![Box::new(client)]);
        let (mut rs, sink) = recordset::channel(16, 5);

        let server_task = tokio::spawn(async move {
            let mut header = [0u8; 8];
            server.read_exact(&mut header).await.unwrap();
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut body = vec![0u8; len];
            server.read_exact(&mut body).await.unwrap();
            let req = WireRequest::decode(&body).unwrap();

            let reply = encode_frames(vec![
                Frame::response(0, true, payload(&[(3, 0), (3, 1)], &[3])),
                Frame::response(0, false, payload(&[(4, 0)], &[4])),
            ]);
            server.write_all(&reply).await.unwrap();
            req
        });

        let cmd = DirectScanCommand::new(pool.clone(), request(), assignment(&[3, 4]), sink.producer(), None);
        let np = cmd.execute().await;

        let req = server_task.await.unwrap();
        assert_eq!(req.partitions, vec![3, 4]);
        assert_eq!(req.task_id, 5);

        assert!(np.partitions().iter().all(|p| p.is_done()));
        assert_eq!(np.record_count(), 3);
        let stats = pool.stats();
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.discarded, 0);

        drop(sink);
        let mut n = 0;
        while let Some(item) = rs.next_record().await {
            item.unwrap();
            n += 1;
        }
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_failure_before_first_frame_returns_connection_once() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let pool = pool_with(vec![Box::new(client)]);
        let (mut rs, sink) = recordset::channel(16, 5);

        let cmd = DirectScanCommand::new(pool.clone(), request(), assignment(&[1]), sink.producer(), None);
        let np = cmd.execute().await;

        assert!(np.error().is_some());
        assert!(!np.partitions()[0].is_done());
        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.discarded, 1);

        // Retryable: left for the tracker, nothing forwarded yet
        drop(sink);
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_write_bearing_failure_forwarded_once() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let pool = pool_with(vec![Box::new(client)]);
        let (mut rs, sink) = recordset::channel(16, 5);
        let mut req = ScanRequest::new("test", None, &[], ScanPolicy::test(), 5);
        req.read_only = false;

        let cmd = DirectScanCommand::new(pool.clone(), Arc::new(req), assignment(&[1]), sink.producer(), None);
        let np = cmd.execute().await;

        assert!(matches!(np.error(), Some(ScanError::Transport { retryable: false, .. })));
        assert_eq!(pool.stats().outstanding(), 0);
        drop(sink);
        assert!(matches!(rs.next_record().await, Some(Err(ScanError::Transport { .. }))));
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_reported() {
        let pool = pool_with(Vec::new());
        let (_rs, sink) = recordset::channel(16, 5);
        let cmd = DirectScanCommand::new(pool.clone(), request(), assignment(&[1]), sink.producer(), None);
        let np = cmd.execute().await;
        assert!(np.error().is_some_and(|e| e.is_retryable()));
        assert_eq!(pool.stats().acquired, 0);
    }

    #[tokio::test]
    async fn test_read_timeout_is_retryable() {
        let (client, _server) = tokio::io::duplex(1024);
        let pool = pool_with(vec![Box::new(client)]);
        let (_rs, sink) = recordset::channel(16, 5);
        let mut policy = ScanPolicy::test();
        policy.base.socket_timeout = Duration::from_millis(20);
        let req = Arc::new(ScanRequest::new("test", None, &[], policy, 5));

        let np = DirectScanCommand::new(pool.clone(), req, assignment(&[1]), sink.producer(), None)
            .execute()
            .await;
        assert!(matches!(np.error(), Some(ScanError::Timeout { retryable: true, .. })));
        assert_eq!(pool.stats().discarded, 1);
    }
}
