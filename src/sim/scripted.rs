//! Scripted transports for driving the decode loop frame by frame

use super::node::sim_record;
use crate::command::proxy::{ProxyResponse, ResponseStream, RpcError};
use crate::command::stream::FrameSource;
use crate::error::ScanError;
use crate::protocol::record::{encode_partition_done, encode_record};
use crate::protocol::{result_code, Frame};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Payload with simulated records `(partition, ordinal)` followed by
/// successful partition-done markers
pub fn payload(records: &[(u16, u64)], done: &[u16]) -> Bytes {
    let mut buf = BytesMut::new();
    for (partition, ordinal) in records {
        let record = sim_record("test", *partition, *ordinal);
        // sim records always fit the wire limits
        let _ = encode_record(&mut buf, *partition, &record);
    }
    for partition in done {
        encode_partition_done(&mut buf, *partition, result_code::OK);
    }
    buf.freeze()
}

/// Yields a fixed list of frames, then an optional error, then `None`
pub struct ScriptedFrames {
    frames: VecDeque<Frame>,
    tail: Option<ScanError>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFrames {
    pub fn new(frames: Vec<Frame>) -> Self {
        ScriptedFrames {
            frames: frames.into(),
            tail: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail with `err` once the frames run out
    pub fn then_fail(mut self, err: ScanError) -> Self {
        self.tail = Some(err);
        self
    }

    /// Counter of `next_frame` calls
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl FrameSource for ScriptedFrames {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, ScanError>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            match self.frames.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => match &self.tail {
                    Some(err) => Err(err.clone()),
                    None => Ok(None),
                },
            }
        })
    }
}

/// RPC response stream replaying a fixed script
pub struct ScriptedResponses {
    responses: VecDeque<Result<ProxyResponse, RpcError>>,
    calls: Arc<AtomicUsize>,
    stall: bool,
}

impl ScriptedResponses {
    pub fn new(responses: Vec<Result<ProxyResponse, RpcError>>) -> Self {
        ScriptedResponses {
            responses: responses.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            stall: false,
        }
    }

    /// Never answer once the script runs out
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Counter of `recv` calls
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl ResponseStream for ScriptedResponses {
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProxyResponse>, RpcError>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            match self.responses.pop_front() {
                Some(response) => response.map(Some),
                None if self.stall => futures::future::pending().await,
                None => Ok(None),
            }
        })
    }
}
