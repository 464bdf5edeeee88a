//! Scan Executor - the round loop
//!
//! ```text
//! scan_partitions()
//!   └─ spawn ──► loop {
//!                  assign unfinished partitions ─► one command per node (JoinSet)
//!                  collect NodePartitions        ◄─ commands exit
//!                  tracker.is_complete()?
//!                    true  → done
//!                    false → sleep_between_retries, next round
//!                    Err   → sticky error, forwarded once to the recordset
//!                }
//! ```
//!
//! The executor holds its own producer guard for the whole operation, so the
//! recordset closes only after the final round has been evaluated.

use crate::cluster::{NodeId, PartitionMap};
use crate::command::{DirectScanCommand, ProxyScanCommand, ScanRequest, StreamingCommand};
use crate::config::{ClusterConfig, ScanPolicy};
use crate::error::ScanError;
use crate::partition::{NodePartitions, PartitionFilter, PartitionTracker};
use crate::pool::{ProxyPool, SocketPool};
use crate::recordset::{self, ProducerGuard, RecordSink, Recordset};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// How commands reach the cluster
#[derive(Clone)]
pub enum Transport {
    /// One socket per owning node
    Direct(Arc<SocketPool>),
    /// Everything through the proxy, which routes partitions itself
    Proxy(Arc<ProxyPool>),
}

/// Outcome of a finished scan
#[derive(Debug, Clone)]
pub struct ScanSummary {
    /// Filter carrying the final cursor; pass it to a new scan to resume
    pub filter: PartitionFilter,
    pub iterations: u32,
    pub record_count: u64,
    /// Ended without error or cancellation
    pub complete: bool,
    pub error: Option<ScanError>,
}

/// A running scan
pub struct ScanHandle {
    pub recordset: Recordset,
    task: JoinHandle<ScanSummary>,
}

impl ScanHandle {
    /// Wait for the round loop to finish. Dropping the recordset first cancels
    /// the scan if it was not drained.
    pub async fn finish(self) -> Result<ScanSummary, JoinError> {
        drop(self.recordset);
        self.task.await
    }

    pub fn into_parts(self) -> (Recordset, JoinHandle<ScanSummary>) {
        (self.recordset, self.task)
    }
}

/// Runs partition scans against a cluster
pub struct ScanExecutor {
    transport: Transport,
    partition_map: Arc<dyn PartitionMap>,
    cluster: ClusterConfig,
}

impl ScanExecutor {
    pub fn new(
        transport: Transport,
        partition_map: Arc<dyn PartitionMap>,
        cluster: ClusterConfig,
    ) -> Self {
        ScanExecutor {
            transport,
            partition_map,
            cluster,
        }
    }

    /// Start scanning the partitions selected by `filter`.
    ///
    /// Fails synchronously only when the filter does not fit the cluster. All
    /// other failures arrive as the recordset's terminal error. Must be called
    /// from within a tokio runtime.
    pub fn scan_partitions(
        &self,
        policy: ScanPolicy,
        filter: PartitionFilter,
        namespace: &str,
        set_name: Option<&str>,
        bin_names: &[&str],
    ) -> Result<ScanHandle, ScanError> {
        let tracker = PartitionTracker::new(&filter, &self.cluster, &policy)?;
        let task_id: u64 = rand::random();
        let (recordset, sink) = recordset::channel(policy.record_queue_size, task_id);
        let guard = sink.producer();

        info!(
            "Starting scan {} of {}/{} over {} partitions",
            task_id,
            namespace,
            set_name.unwrap_or("*"),
            tracker.partitions().len()
        );

        let run = ScanRun {
            transport: self.transport.clone(),
            partition_map: self.partition_map.clone(),
            request: Arc::new(ScanRequest::new(namespace, set_name, bin_names, policy, task_id)),
            tracker,
            sink,
        };
        let task = tokio::spawn(run.run(guard));
        Ok(ScanHandle { recordset, task })
    }
}

struct ScanRun {
    transport: Transport,
    partition_map: Arc<dyn PartitionMap>,
    request: Arc<ScanRequest>,
    tracker: PartitionTracker,
    sink: RecordSink,
}

impl ScanRun {
    async fn run(mut self, guard: ProducerGuard) -> ScanSummary {
        let task_id = self.request.task_id;
        let policy = self.request.policy.clone();
        let mut error = None;

        let complete = loop {
            let assignments = match &self.transport {
                Transport::Direct(_) => self
                    .tracker
                    .assign_partitions(&self.request.namespace, self.partition_map.as_ref()),
                Transport::Proxy(_) => self.tracker.assign_all(NodeId::proxy()),
            };
            info!(
                "Scan {} round {}: {} commands, {} partitions deferred",
                task_id,
                self.tracker.iteration(),
                assignments.len(),
                self.tracker.deferred().len()
            );

            let results = self.run_round(assignments).await;

            match self
                .tracker
                .is_complete(policy.allow_partial, &policy.base, &results)
            {
                Ok(true) => {
                    break guard.is_active() || self.tracker.partitions().iter().all(|p| p.is_done())
                }
                Ok(false) => {
                    if !guard.is_active() {
                        debug!("Scan {} cancelled by caller", task_id);
                        break false;
                    }
                    warn!(
                        "Scan {} round {} incomplete, retrying",
                        task_id,
                        self.tracker.iteration()
                    );
                    let pause = policy.base.sleep_between_retries;
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = guard.cancelled() => break false,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                Err(err) => {
                    error!("Scan {} failed: {}", task_id, err);
                    self.tracker.partition_error(err.clone());
                    guard.send_error(err.clone()).await;
                    error = Some(err);
                    break false;
                }
            }
        };

        info!(
            "Scan {} finished after {} rounds: {} records, complete={}",
            task_id,
            self.tracker.iteration(),
            self.tracker.record_count(),
            complete
        );
        ScanSummary {
            filter: self.tracker.to_filter(),
            iterations: self.tracker.iteration(),
            record_count: self.tracker.record_count(),
            complete,
            error,
        }
    }

    /// Run one command per assignment and collect the assignments back
    async fn run_round(&self, assignments: Vec<NodePartitions>) -> Vec<NodePartitions> {
        let limit = self.request.policy.max_concurrent_nodes;
        let permits = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let deadline = self.tracker.deadline();
        let iteration = self.tracker.iteration();

        let mut commands = JoinSet::new();
        for partitions in assignments {
            let producer = self.sink.producer();
            let command = match &self.transport {
                Transport::Direct(pool) => StreamingCommand::Direct(DirectScanCommand::new(
                    pool.clone(),
                    self.request.clone(),
                    partitions,
                    producer,
                    deadline,
                )),
                Transport::Proxy(pool) => StreamingCommand::Proxy(ProxyScanCommand::new(
                    pool.clone(),
                    self.request.clone(),
                    self.tracker.to_filter(),
                    iteration,
                    partitions,
                    producer,
                    deadline,
                )),
            };
            let permits = permits.clone();
            commands.spawn(async move {
                let _permit = match permits {
                    Some(permits) => permits.acquire_owned().await.ok(),
                    None => None,
                };
                command.execute().await
            });
        }

        let mut results = Vec::with_capacity(commands.len());
        while let Some(joined) = commands.join_next().await {
            match joined {
                Ok(partitions) => results.push(partitions),
                // Its partitions stay pending in the tracker
                Err(e) => error!("Scan command task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.node().cmp(b.node()));
        results
    }
}
