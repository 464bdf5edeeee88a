//! Recordset - the single-consumer output channel of a scan
//!
//! ## Architecture
//!
//! ```text
//! command (node A) ──┐
//! command (node B) ──┤──► bounded mpsc ──► Recordset (Stream) ──► caller
//! executor loop ─────┘
//!        ▲
//!        └── each holds a ProducerGuard; the last guard dropped closes the channel
//! ```
//!
//! Every producer owns a [`ProducerGuard`]. Dropping the guard is the producer's
//! end-of-stream signal, so it fires on every exit path, panics included. The
//! channel closes when the last outstanding guard is dropped.
//!
//! At most one terminal error is ever delivered. Once it is queued, producers see
//! the recordset as inactive and the consumer stops after reading it, so records
//! still buffered by other nodes are never observed.

use crate::error::ScanError;
use crate::protocol::Record;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Item = Result<Record, ScanError>;

struct Shared {
    /// Master sender; taken (and dropped) by the last producer to finish
    tx: Mutex<Option<mpsc::Sender<Item>>>,
    producers: AtomicUsize,
    cancel: CancellationToken,
    error_sent: AtomicBool,
}

impl Shared {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.error_sent.load(Ordering::Acquire)
    }
}

/// Create a recordset and the sink its producers are registered through
pub fn channel(capacity: usize, task_id: u64) -> (Recordset, RecordSink) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        tx: Mutex::new(Some(tx)),
        producers: AtomicUsize::new(0),
        cancel: CancellationToken::new(),
        error_sent: AtomicBool::new(false),
    });
    (
        Recordset {
            rx,
            shared: shared.clone(),
            task_id,
            finished: false,
        },
        RecordSink { shared },
    )
}

/// Consumer side. Yields records in arrival order, then at most one error.
pub struct Recordset {
    rx: mpsc::Receiver<Item>,
    shared: Arc<Shared>,
    task_id: u64,
    finished: bool,
}

impl Recordset {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// False once the caller cancelled or a terminal error was queued
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Next record, `Some(Err(_))` for the terminal error, `None` at the end
    pub async fn next_record(&mut self) -> Option<Item> {
        futures::StreamExt::next(self).await
    }

    /// Cancel the scan. Blocked producers wake and stop.
    pub fn close(&mut self) {
        self.shared.cancel.cancel();
        self.rx.close();
        self.finished = true;
    }
}

impl Stream for Recordset {
    type Item = Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(record))) => Poll::Ready(Some(Ok(record))),
            Poll::Ready(Some(Err(err))) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Recordset {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Registers producers on a recordset
#[derive(Clone)]
pub struct RecordSink {
    shared: Arc<Shared>,
}

impl RecordSink {
    /// Register a producer. Its guard must be held until the producer exits.
    pub fn producer(&self) -> ProducerGuard {
        self.shared.producers.fetch_add(1, Ordering::AcqRel);
        let tx = self.shared.tx.lock().clone();
        ProducerGuard {
            shared: self.shared.clone(),
            tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Resolves when the caller cancels
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }
}

/// A registered producer. Dropping it signals this producer's end.
pub struct ProducerGuard {
    shared: Arc<Shared>,
    tx: Option<mpsc::Sender<Item>>,
}

impl ProducerGuard {
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Resolves when the caller cancels
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Deliver a record, waiting for capacity. Returns false when the record
    /// was not delivered because the recordset is no longer active.
    pub async fn send(&self, record: Record) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            res = tx.send(Ok(record)) => res.is_ok(),
        }
    }

    /// Deliver the terminal error. Only the first call across all producers
    /// has any effect. Returns whether this call delivered it.
    pub async fn send_error(&self, err: ScanError) -> bool {
        if self.shared.error_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            res = tx.send(Err(err)) => res.is_ok(),
        }
    }

    fn signal_end(&mut self) {
        self.tx = None;
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.tx.lock().take();
        }
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.signal_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Digest;
    use crate::protocol::{Bins, Key};
    use std::time::Duration;

    fn record(n: u8) -> Record {
        Record {
            key: Key {
                namespace: Arc::from("test"),
                set_name: None,
                digest: Digest([n; 20]),
            },
            bins: Bins::new(),
            generation: 1,
            expiration: 0,
        }
    }

    #[tokio::test]
    async fn test_closes_after_last_producer() {
        let (mut rs, sink) = channel(16, 1);
        let a = sink.producer();
        let b = sink.producer();

        assert!(a.send(record(1)).await);
        drop(a);
        assert!(b.send(record(2)).await);
        drop(b);

        assert_eq!(rs.next_record().await.unwrap().unwrap().key.digest, Digest([1; 20]));
        assert_eq!(rs.next_record().await.unwrap().unwrap().key.digest, Digest([2; 20]));
        assert!(rs.next_record().await.is_none());
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_error() {
        let (mut rs, sink) = channel(16, 1);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let guard = sink.producer();
            tasks.push(tokio::spawn(async move {
                guard.send_error(ScanError::Protocol(format!("p{}", i))).await
            }));
        }
        let mut delivered = 0;
        for task in tasks {
            if task.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);

        assert!(matches!(rs.next_record().await, Some(Err(ScanError::Protocol(_)))));
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_no_records_after_error() {
        let (mut rs, sink) = channel(16, 1);
        let a = sink.producer();
        let b = sink.producer();
        assert!(a.send(record(1)).await);
        assert!(a.send_error(ScanError::Protocol("bad".into())).await);
        assert!(!b.is_active());
        assert!(!b.send(record(2)).await);
        drop((a, b));

        assert!(rs.next_record().await.unwrap().is_ok());
        assert!(rs.next_record().await.unwrap().is_err());
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let (mut rs, sink) = channel(1, 1);
        let guard = sink.producer();
        assert!(guard.send(record(1)).await);

        let blocked = tokio::spawn(async move { guard.send(record(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        rs.close();

        let sent = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!sent);
        assert!(!sink.is_active());
        assert!(rs.next_record().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_recordset_cancels() {
        let (rs, sink) = channel(4, 9);
        assert_eq!(rs.task_id(), 9);
        let guard = sink.producer();
        drop(rs);
        assert!(!guard.is_active());
        assert!(!guard.send(record(1)).await);
    }
}
