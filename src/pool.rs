//! Connection and buffer pooling
//!
//! The pool implements the acquire/return contract commands rely on:
//!
//! - a handle is owned by exactly one command for the command's lifetime
//! - [`PooledConnection`] returns it on drop, so every exit path releases it once
//! - broken handles are discarded instead of going back to the idle set
//!
//! Connections are opened lazily through a [`Connector`], which is how both the
//! socket transport and the proxy RPC client plug in.

use crate::cluster::NodeId;
use crate::command::proxy::ScanRpc;
use crate::config::PoolConfig;
use crate::error::ScanError;
use ahash::AHashMap;
use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Byte stream usable as a direct-socket connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Pool of direct-socket connections
pub type SocketPool = ConnectionPool<BoxedStream>;

/// Pool of proxy RPC clients
pub type ProxyPool = ConnectionPool<Box<dyn ScanRpc>>;

/// Opens new connections to a node
pub trait Connector<C>: Send + Sync {
    fn connect<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> Pin<Box<dyn Future<Output = Result<C, ScanError>> + Send + 'a>>;
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub opened: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
}

impl PoolStats {
    /// Handles currently checked out
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

/// Per-node idle connections behind a global checkout limit
pub struct ConnectionPool<C> {
    connector: Box<dyn Connector<C>>,
    idle: Mutex<AHashMap<NodeId, Arc<ArrayQueue<C>>>>,
    idle_per_node: usize,
    permits: Arc<Semaphore>,
    buffers: BufferPool,
    counters: Counters,
    closed: AtomicBool,
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(connector: impl Connector<C> + 'static, config: &PoolConfig) -> Self {
        ConnectionPool {
            connector: Box::new(connector),
            idle: Mutex::new(AHashMap::new()),
            idle_per_node: config.idle_per_node,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            buffers: BufferPool::new(config.buffer_pool_size, config.buffer_capacity),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a connection to `node`, reusing an idle one when available.
    /// Waits while `max_connections` handles are checked out.
    pub async fn acquire(self: &Arc<Self>, node: &NodeId) -> Result<PooledConnection<C>, ScanError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScanError::Pool("pool closed".to_string()))?;

        let conn = match self.idle_queue(node).and_then(|q| q.pop()) {
            Some(conn) => conn,
            None => {
                let conn = self.connector.connect(node).await?;
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                debug!("Opened connection to node {}", node);
                conn
            }
        };

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            pool: self.clone(),
            node: node.clone(),
            conn: Some(conn),
            broken: false,
            _permit: permit,
        })
    }

    fn idle_queue(&self, node: &NodeId) -> Option<Arc<ArrayQueue<C>>> {
        if self.idle_per_node == 0 {
            return None;
        }
        let mut idle = self.idle.lock();
        let queue = idle
            .entry(node.clone())
            .or_insert_with(|| Arc::new(ArrayQueue::new(self.idle_per_node)));
        Some(queue.clone())
    }

    fn release(&self, node: &NodeId, conn: C, broken: bool) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        if broken || self.closed.load(Ordering::Acquire) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let kept = match self.idle_queue(node) {
            Some(queue) => queue.push(conn).is_ok(),
            None => false,
        };
        if !kept {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reject further checkouts and drop idle connections
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.counters.opened.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Checked-out connection. Returned to its pool exactly once, on drop.
pub struct PooledConnection<C: Send + 'static> {
    pool: Arc<ConnectionPool<C>>,
    node: NodeId,
    conn: Option<C>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send + 'static> PooledConnection<C> {
    /// Discard instead of reusing when returned
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl<C: Send + 'static> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is present until drop"),
        }
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is present until drop"),
        }
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.node, conn, self.broken);
        }
    }
}

/// Reusable encode buffers
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(size: usize, buffer_capacity: usize) -> Self {
        let pool = ArrayQueue::new(size.max(1));
        for _ in 0..size {
            let _ = pool.push(BytesMut::with_capacity(buffer_capacity));
        }
        BufferPool {
            pool,
            capacity: buffer_capacity,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Return a buffer; oversized buffers are dropped
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() <= self.capacity * 2 {
            let _ = self.pool.push(buf);
        }
    }
}
