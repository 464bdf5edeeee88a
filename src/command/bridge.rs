//! Adapts an RPC response stream to the frame interface of the decode loop

use super::proxy::{ResponseStream, RpcCode, RpcError};
use super::stream::{read_limit, FrameSource};
use crate::cluster::NodeId;
use crate::error::ScanError;
use crate::protocol::Frame;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// Turns RPC response chunks into frames.
///
/// Once the final chunk (or the end of the RPC stream) has been seen, every
/// further call returns `Ok(None)` without touching the RPC stream.
pub struct ProxyBridge {
    stream: Box<dyn ResponseStream>,
    node: NodeId,
    read_only: bool,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
    eos: bool,
}

impl ProxyBridge {
    pub fn new(
        stream: Box<dyn ResponseStream>,
        node: NodeId,
        read_only: bool,
        socket_timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Self {
        ProxyBridge {
            stream,
            node,
            read_only,
            socket_timeout,
            deadline,
            eos: false,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    async fn pull(&mut self) -> Result<Option<Frame>, ScanError> {
        if self.eos {
            return Ok(None);
        }

        let received = match read_limit(self.socket_timeout, self.deadline) {
            Some(limit) => tokio::time::timeout(limit, self.stream.recv())
                .await
                .unwrap_or_else(|_| Err(RpcError::new(RpcCode::DeadlineExceeded, "recv"))),
            None => self.stream.recv().await,
        };

        match received {
            Ok(Some(response)) => {
                if !response.has_next {
                    self.eos = true;
                }
                let mut frame = Frame::response(
                    response.status,
                    response.has_next,
                    Bytes::from(response.payload),
                );
                frame.compressed = response.compressed;
                Ok(Some(frame))
            }
            Ok(None) => {
                self.eos = true;
                Ok(None)
            }
            Err(err) => Err(err.into_scan_error(&self.node, self.read_only)),
        }
    }
}

impl FrameSource for ProxyBridge {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, ScanError>> + Send + '_>> {
        Box::pin(self.pull())
    }
}
