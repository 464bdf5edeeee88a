//! Transport-agnostic decode loop
//!
//! Both command variants hand the loop a [`FrameSource`]. The loop pulls frames
//! until the final one, forwards records to the recordset, and keeps the
//! command's `NodePartitions` current so the tracker can resume from it.

use crate::cluster::NodeId;
use crate::config::ScanPolicy;
use crate::error::ScanError;
use crate::partition::NodePartitions;
use crate::protocol::{result_code, Entry, Frame, MessageType, PayloadReader, WireRequest};
use crate::recordset::ProducerGuard;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Supplies response frames one at a time
pub trait FrameSource: Send {
    /// Next frame, or `None` if the transport has nothing more to give
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, ScanError>> + Send + '_>>;
}

/// Fields shared by every command of one scan operation
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub namespace: Arc<str>,
    pub set_name: Option<String>,
    pub bin_names: Vec<String>,
    pub policy: ScanPolicy,
    pub task_id: u64,
    /// Scans never write; background operations that do set this to false
    pub read_only: bool,
}

impl ScanRequest {
    pub fn new(
        namespace: &str,
        set_name: Option<&str>,
        bin_names: &[&str],
        policy: ScanPolicy,
        task_id: u64,
    ) -> Self {
        ScanRequest {
            namespace: Arc::from(namespace),
            set_name: set_name.map(str::to_string),
            bin_names: bin_names.iter().map(|b| b.to_string()).collect(),
            policy,
            task_id,
            read_only: true,
        }
    }

    /// Wire request for one node's assignment
    pub fn wire_request(&self, partitions: &NodePartitions) -> WireRequest {
        WireRequest {
            namespace: self.namespace.to_string(),
            set_name: self.set_name.clone(),
            bin_names: self.bin_names.clone(),
            task_id: self.task_id,
            socket_timeout_ms: self.policy.base.socket_timeout.as_millis().min(u32::MAX as u128)
                as u32,
            max_records: partitions.records_requested(),
            read_only: self.read_only,
            include_bin_data: self.policy.include_bin_data,
            compress_response: self.policy.base.compress,
            partitions: partitions.full_partitions().collect(),
            resume: partitions.partial_partitions().collect(),
            keys: partitions.keys().to_vec(),
        }
    }
}

/// Lifecycle of one command instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Created,
    Sending,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Errored | CommandState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        match (self, next) {
            (Created, Sending) => true,
            (Sending, Streaming) => true,
            (Streaming, Completed) => true,
            (from, Errored | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// How the decode loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Final frame consumed
    Completed,
    /// Recordset went inactive; no further frames were requested
    Cancelled,
    Failed(ScanError),
}

impl StreamOutcome {
    pub fn state(&self) -> CommandState {
        match self {
            StreamOutcome::Completed => CommandState::Completed,
            StreamOutcome::Cancelled => CommandState::Cancelled,
            StreamOutcome::Failed(_) => CommandState::Errored,
        }
    }
}

/// Read deadline for the next transport call
pub(crate) fn read_limit(socket_timeout: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (socket_timeout, remaining) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Record `err` on the assignment and forward it to the caller if it is fatal.
/// Retryable errors stay with the assignment for the tracker to act on.
pub(crate) async fn report_failure(
    partitions: &mut NodePartitions,
    producer: &ProducerGuard,
    err: ScanError,
) -> StreamOutcome {
    if err.is_retryable() {
        warn!(
            "Node {} failed with retryable error, {} partitions left for next round: {}",
            partitions.node(),
            partitions.partitions().iter().filter(|p| !p.is_done()).count(),
            err
        );
    } else {
        error!("Node {} failed: {}", partitions.node(), err);
        producer.send_error(err.clone()).await;
    }
    partitions.set_error(err.clone());
    StreamOutcome::Failed(err)
}

/// Decode response frames until the final one.
///
/// A non-zero frame status becomes a `Server` error, surfaced after the frame's
/// payload has been delivered. Partitions of that node that were not explicitly
/// finished stay unfinished.
pub async fn decode_stream<S: FrameSource + ?Sized>(
    source: &mut S,
    request: &ScanRequest,
    partitions: &mut NodePartitions,
    producer: &ProducerGuard,
) -> StreamOutcome {
    let node: NodeId = partitions.node().clone();
    let mut frames = 0usize;

    loop {
        if !producer.is_active() {
            debug!("Node {}: recordset inactive after {} frames", node, frames);
            return StreamOutcome::Cancelled;
        }

        let next = tokio::select! {
            biased;
            _ = producer.cancelled() => return StreamOutcome::Cancelled,
            next = source.next_frame() => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let err = ScanError::transport(
                    &node,
                    "stream ended before the final frame",
                    request.read_only,
                );
                return report_failure(partitions, producer, err).await;
            }
            Err(err) => return report_failure(partitions, producer, err).await,
        };
        frames += 1;

        if frame.msg_type != MessageType::ScanResponse {
            let err = ScanError::Protocol(format!("unexpected {:?} frame", frame.msg_type));
            return report_failure(partitions, producer, err).await;
        }

        let status = frame.status;
        let has_more = frame.has_more;
        let payload = match frame.into_payload() {
            Ok(payload) => payload,
            Err(err) => return report_failure(partitions, producer, err).await,
        };

        for entry in PayloadReader::new(request.namespace.clone(), payload) {
            match entry {
                Ok(Entry::Record { partition, record }) => {
                    let digest = record.key.digest;
                    if !partitions.contains(partition) {
                        warn!(
                            "Node {} sent record for unassigned partition {}",
                            node, partition
                        );
                        continue;
                    }
                    if !producer.send(record).await {
                        return StreamOutcome::Cancelled;
                    }
                    partitions.record_received(partition, digest);
                }
                Ok(Entry::PartitionDone {
                    partition,
                    result_code: code,
                }) => {
                    if code == result_code::OK {
                        partitions.mark_done(partition);
                    } else {
                        debug!(
                            "Node {}: partition {} unavailable ({})",
                            node,
                            partition,
                            result_code::describe(code)
                        );
                        partitions.mark_unavailable(partition);
                    }
                }
                Err(err) => return report_failure(partitions, producer, err).await,
            }
        }

        if status != result_code::OK {
            let err = ScanError::Server {
                node: node.clone(),
                code: status,
            };
            return report_failure(partitions, producer, err).await;
        }

        if !has_more {
            partitions.finish_stream();
            partitions.verify_invariants();
            debug!(
                "Node {}: stream complete, {} frames, {} records",
                node,
                frames,
                partitions.record_count()
            );
            return StreamOutcome::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionState, PartitionStatus};
    use crate::protocol::result_code::{PARTITION_UNAVAILABLE, SERVER_ERROR};
    use crate::recordset;
    use crate::sim::scripted::{payload, ScriptedFrames};
    use std::sync::atomic::Ordering;

    fn assignment(ids: &[u16]) -> NodePartitions {
        let mut np = NodePartitions::new(NodeId::new("A"), ids.len());
        for id in ids {
            np.add_partition(PartitionStatus::new(*id));
        }
        np
    }

    fn request() -> ScanRequest {
        ScanRequest::new("test", Some("users"), &[], ScanPolicy::test(), 1)
    }

    async fn drain(rs: &mut recordset::Recordset) -> (usize, usize) {
        let mut records = 0;
        let mut errors = 0;
        while let Some(item) = rs.next_record().await {
            match item {
                Ok(_) => records += 1,
                Err(_) => errors += 1,
            }
        }
        (records, errors)
    }

    #[tokio::test]
    async fn test_k_frames_delivered_then_stop() {
        let frames = vec![
            Frame::response(0, true, payload(&[(1, 0), (1, 1)], &[])),
            Frame::response(0, true, payload(&[(2, 0)], &[1])),
            Frame::response(0, false, payload(&[(2, 1), (2, 2)], &[2])),
        ];
        let mut source = ScriptedFrames::new(frames);
        let calls = source.calls();
        let (mut rs, sink) = recordset::channel(16, 1);
        let mut np = assignment(&[1, 2]);

        let producer = sink.producer();
        let outcome = decode_stream(&mut source, &request(), &mut np, &producer).await;
        drop(producer);

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(np.record_count(), 5);
        assert!(np.partitions().iter().all(|p| p.is_done()));
        assert!(np.error().is_none());
        assert_eq!(drain(&mut rs).await, (5, 0));
    }

    #[tokio::test]
    async fn test_error_status_delivers_payload_then_one_error() {
        let frames = vec![
            Frame::response(0, true, payload(&[(1, 0)], &[1])),
            Frame::response(SERVER_ERROR, true, payload(&[(2, 0), (2, 1)], &[])),
            Frame::response(0, false, payload(&[(2, 2)], &[2])),
        ];
        let mut source = ScriptedFrames::new(frames);
        let calls = source.calls();
        let (mut rs, sink) = recordset::channel(16, 1);
        let mut np = assignment(&[1, 2]);

        let producer = sink.producer();
        let outcome = decode_stream(&mut source, &request(), &mut np, &producer).await;
        drop(producer);

        assert!(matches!(
            outcome,
            StreamOutcome::Failed(ScanError::Server { code: SERVER_ERROR, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(np.partitions()[0].state, PartitionState::Done);
        assert_eq!(np.partitions()[1].state, PartitionState::Pending);
        assert_eq!(np.record_count(), 3);
        assert!(np.error().is_some());
        assert_eq!(drain(&mut rs).await, (3, 1));
    }

    #[tokio::test]
    async fn test_unavailable_partition_left_for_retry() {
        let mut body = bytes::BytesMut::new();
        crate::protocol::record::encode_partition_done(&mut body, 2, PARTITION_UNAVAILABLE);
        let frames = vec![
            Frame::response(0, true, body.freeze()),
            Frame::response(0, false, payload(&[(1, 0)], &[1])),
        ];
        let mut source = ScriptedFrames::new(frames);
        let (_rs, sink) = recordset::channel(16, 1);
        let mut np = assignment(&[1, 2]);
        let producer = sink.producer();

        let outcome = decode_stream(&mut source, &request(), &mut np, &producer).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(np.parts_unavailable(), 1);
        assert_eq!(np.partitions()[1].state, PartitionState::Errored);
    }

    #[tokio::test]
    async fn test_retryable_transport_error_not_forwarded() {
        let node = NodeId::new("A");
        let mut source = ScriptedFrames::new(vec![Frame::response(0, true, payload(&[(1, 0)], &[]))])
            .then_fail(ScanError::transport(&node, "reset", true));
        let (mut rs, sink) = recordset::channel(16, 1);
        let mut np = assignment(&[1]);

        let producer = sink.producer();
        let outcome = decode_stream(&mut source, &request(), &mut np, &producer).await;
        drop(producer);

        assert!(matches!(outcome, StreamOutcome::Failed(ref e) if e.is_retryable()));
        assert_eq!(np.partitions()[0].state, PartitionState::Pending);
        assert!(np.partitions()[0].digest.is_some());
        assert_eq!(drain(&mut rs).await, (1, 0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_cancel_stops_at_frame_boundary() {
        let frames = (0..10)
            .map(|i| Frame::response(0, i < 9, payload(&[(1, i)], &[])))
            .collect();
        let mut source = ScriptedFrames::new(frames);
        let calls = source.calls();
        let (mut rs, sink) = recordset::channel(16, 1);
        let mut np = assignment(&[1]);
        let producer = sink.producer();

        let req = request();
        let consumer = async {
            let first = rs.next_record().await;
            rs.close();
            (first, calls.load(Ordering::SeqCst))
        };
        let (outcome, (first, calls_at_close)) = tokio::join!(
            decode_stream(&mut source, &req, &mut np, &producer),
            consumer
        );

        assert!(first.unwrap().is_ok());
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), calls_at_close);
        assert!(calls_at_close < 10);
        assert!(np.partitions()[0].state != PartitionState::Done);
    }

    #[test]
    fn test_state_transitions() {
        use CommandState::*;
        assert!(Created.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Errored));
        assert!(Streaming.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Errored));
        assert!(!Created.can_transition_to(Completed));
    }

    #[test]
    fn test_read_limit_takes_the_earlier() {
        let now = Instant::now();
        let limit = read_limit(Some(Duration::from_secs(5)), Some(now + Duration::from_secs(1)));
        assert!(limit.unwrap() <= Duration::from_secs(1));
        assert_eq!(read_limit(Some(Duration::from_secs(5)), None), Some(Duration::from_secs(5)));
        assert_eq!(read_limit(None, None), None);
    }
}
