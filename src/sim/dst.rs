//! Deterministic Simulation Testing for partition scans
//!
//! Each seed builds a simulated cluster and runs a sequence of scans through
//! the real `ScanExecutor`, on a single-threaded runtime. Filters, paging,
//! queue sizes and early cancellation are chosen by the seeded RNG; node
//! faults (unavailable partitions, dropped connections, ownership migration)
//! come from the cluster's own fault schedule.
//!
//! ## Invariants checked per scan
//!
//! - no record is delivered twice, across retries and across resumed pages
//! - every delivered record belongs to the filter
//! - a scan that ends without error delivered every record of the filter
//! - at most one terminal error, and only the retry budget may produce one
//! - every pooled connection is returned once the scan has finished
//!
//! ## Usage
//!
//! ```rust,ignore
//! for seed in 0..100 {
//!     let mut harness = ScanDSTHarness::with_seed(seed);
//!     harness.run(20);
//!     assert!(harness.result().is_success(), "Seed {} failed", seed);
//! }
//! ```

use super::cluster::{SimCluster, SimConfig, SIM_NAMESPACE};
use super::node::{sim_digest, SimFaults};
use super::rng::SimRng;
use crate::cluster::Digest;
use crate::config::{ClusterConfig, PoolConfig, ScanPolicy};
use crate::error::ScanError;
use crate::executor::{ScanExecutor, ScanSummary, Transport};
use crate::partition::PartitionFilter;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

const PAGE_LIMIT: usize = 10_000;
const FINISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for scan DST
#[derive(Debug, Clone)]
pub struct ScanDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub node_count: usize,
    pub partition_count: u16,
    pub records_per_partition: u64,
    pub frame_records: usize,
    pub faults: SimFaults,
    pub migrate_on_unavailable: bool,
    /// Route every scan through the proxy instead of direct sockets
    pub proxy: bool,
    pub max_retries: u32,
    /// Chance a scan is read in pages via `max_records`
    pub page_probability: f64,
    /// Chance the consumer closes the recordset early
    pub cancel_probability: f64,
}

impl Default for ScanDSTConfig {
    fn default() -> Self {
        ScanDSTConfig {
            seed: 0,
            node_count: 3,
            partition_count: 256,
            records_per_partition: 3,
            frame_records: 16,
            faults: SimFaults {
                unavailable_probability: 0.02,
                drop_probability: 0.02,
            },
            migrate_on_unavailable: false,
            proxy: false,
            max_retries: 50,
            page_probability: 0.2,
            cancel_probability: 0.1,
        }
    }
}

impl ScanDSTConfig {
    /// Moderate fault rates
    pub fn new(seed: u64) -> Self {
        ScanDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// No faults: every scan must complete
    pub fn calm(seed: u64) -> Self {
        ScanDSTConfig {
            seed,
            faults: SimFaults::default(),
            ..Default::default()
        }
    }

    /// Frequent faults with ownership migrating on every unavailable partition
    pub fn chaos(seed: u64) -> Self {
        ScanDSTConfig {
            seed,
            frame_records: 4,
            faults: SimFaults {
                unavailable_probability: 0.1,
                drop_probability: 0.1,
            },
            migrate_on_unavailable: true,
            max_retries: 200,
            ..Default::default()
        }
    }

    /// Moderate faults through the proxy transport
    pub fn proxy(seed: u64) -> Self {
        ScanDSTConfig {
            seed,
            proxy: true,
            ..Default::default()
        }
    }

    fn sim_config(&self) -> SimConfig {
        SimConfig {
            node_count: self.node_count,
            partition_count: self.partition_count,
            records_per_partition: self.records_per_partition,
            frame_records: self.frame_records,
            faults: self.faults,
            migrate_on_unavailable: self.migrate_on_unavailable,
        }
    }
}

/// Result of a scan DST run
#[derive(Debug, Clone)]
pub struct ScanDSTResult {
    pub seed: u64,
    pub total_scans: u64,
    /// Ended with every targeted record delivered
    pub completed_scans: u64,
    pub paged_scans: u64,
    pub cancelled_scans: u64,
    /// Ended with the retry budget exhausted
    pub failed_scans: u64,
    pub records_delivered: u64,
    pub rounds: u64,
    pub invariant_violations: Vec<String>,
}

impl ScanDSTResult {
    pub fn new(seed: u64) -> Self {
        ScanDSTResult {
            seed,
            total_scans: 0,
            completed_scans: 0,
            paged_scans: 0,
            cancelled_scans: 0,
            failed_scans: 0,
            records_delivered: 0,
            rounds: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} scans (complete:{}, paged:{}, cancelled:{}, failed:{}), {} records, {} rounds, {} violations",
            self.seed,
            self.total_scans,
            self.completed_scans,
            self.paged_scans,
            self.cancelled_scans,
            self.failed_scans,
            self.records_delivered,
            self.rounds,
            self.invariant_violations.len()
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum ScanMode {
    Full,
    /// Pages of at most this many records, resumed from the returned filter
    Paged(u64),
    /// Close the recordset after this many records
    Cancel(usize),
}

struct ScanPlan {
    label: String,
    filter: PartitionFilter,
    expected: BTreeSet<Digest>,
    policy: ScanPolicy,
    mode: ScanMode,
}

#[derive(Default)]
struct Page {
    records: Vec<Digest>,
    errors: Vec<ScanError>,
    summary: Option<ScanSummary>,
}

#[derive(Default)]
struct ScanOutcome {
    pages: Vec<Page>,
    /// The scan was rejected up front
    rejected: Option<ScanError>,
    /// `finish` did not return in time
    hung: bool,
    outstanding: u64,
}

/// DST harness driving `ScanExecutor` against a simulated cluster
pub struct ScanDSTHarness {
    config: ScanDSTConfig,
    rng: SimRng,
    cluster: SimCluster,
    transport: Transport,
    executor: ScanExecutor,
    result: ScanDSTResult,
}

impl ScanDSTHarness {
    pub fn new(config: ScanDSTConfig) -> Self {
        let mut rng = SimRng::new(config.seed);
        let cluster = SimCluster::new(config.sim_config(), rng.next_u64());
        let pool_config = PoolConfig::default();
        let transport = if config.proxy {
            Transport::Proxy(cluster.proxy_pool(&pool_config))
        } else {
            Transport::Direct(cluster.socket_pool(&pool_config))
        };
        let executor = ScanExecutor::new(
            transport.clone(),
            cluster.partition_map(),
            ClusterConfig {
                partition_count: config.partition_count,
            },
        );
        let result = ScanDSTResult::new(config.seed);

        ScanDSTHarness {
            config,
            rng,
            cluster,
            transport,
            executor,
            result,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::new(ScanDSTConfig::new(seed))
    }

    /// Run `scans` scans one after another
    pub fn run(&mut self, scans: usize) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.violation(format!("cannot start runtime: {}", e));
                return;
            }
        };

        for _ in 0..scans {
            self.result.total_scans += 1;
            let plan = self.plan_scan();
            let outcome = runtime.block_on(self.execute(&plan));
            self.check(&plan, outcome);

            if !self.result.invariant_violations.is_empty() {
                break;
            }
        }
    }

    pub fn result(&self) -> &ScanDSTResult {
        &self.result
    }

    pub fn cluster(&self) -> &SimCluster {
        &self.cluster
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    fn records_of(&self, partition: u16) -> impl Iterator<Item = Digest> {
        (0..self.config.records_per_partition).map(move |ord| sim_digest(partition, ord))
    }

    fn random_partition(&mut self) -> u16 {
        self.rng.gen_range(0, u64::from(self.config.partition_count)) as u16
    }

    // =========================================================================
    // Planning
    // =========================================================================

    fn plan_scan(&mut self) -> ScanPlan {
        let pc = self.config.partition_count;
        let (label, filter, expected) = match self.rng.gen_range(0, 5) {
            0 => {
                let expected: BTreeSet<Digest> = (0..pc).flat_map(|p| self.records_of(p)).collect();
                ("all".to_string(), PartitionFilter::all(), expected)
            }
            1 => {
                let begin = self.random_partition();
                let count = self.rng.gen_range(1, u64::from(pc - begin) + 1) as u16;
                let expected: BTreeSet<Digest> = (begin..begin + count)
                    .flat_map(|p| self.records_of(p))
                    .collect();
                (
                    format!("range {}+{}", begin, count),
                    PartitionFilter::by_range(begin, count),
                    expected,
                )
            }
            2 => {
                let p = self.random_partition();
                let expected: BTreeSet<Digest> = self.records_of(p).collect();
                (format!("id {}", p), PartitionFilter::by_id(p), expected)
            }
            3 => {
                let p = self.random_partition();
                let ord = self.rng.gen_range(0, self.config.records_per_partition);
                let expected: BTreeSet<Digest> = (ord + 1..self.config.records_per_partition)
                    .map(|o| sim_digest(p, o))
                    .collect();
                (
                    format!("after {}/{}", p, ord),
                    PartitionFilter::after_digest(sim_digest(p, ord)),
                    expected,
                )
            }
            _ => {
                let n = self.rng.gen_range(1, 9);
                let keys: Vec<Digest> = (0..n)
                    .map(|_| {
                        let p = self.random_partition();
                        let ord = self.rng.gen_range(0, self.config.records_per_partition);
                        sim_digest(p, ord)
                    })
                    .collect();
                let expected: BTreeSet<Digest> = keys.iter().copied().collect();
                (format!("{} keys", n), PartitionFilter::by_keys(keys), expected)
            }
        };

        let mut policy = ScanPolicy::test();
        policy.base.max_retries = self.config.max_retries;
        policy.record_queue_size = self.rng.gen_range(1, 65) as usize;
        policy.max_concurrent_nodes = self.rng.gen_range(0, self.config.node_count as u64 + 1) as usize;
        policy.base.compress = self.rng.gen_bool(0.2);

        let mode = if self.rng.gen_bool(self.config.cancel_probability) {
            ScanMode::Cancel(self.rng.gen_range(0, expected.len() as u64 + 1) as usize)
        } else if self.rng.gen_bool(self.config.page_probability) {
            ScanMode::Paged(self.rng.gen_range(1, 200))
        } else {
            ScanMode::Full
        };

        ScanPlan {
            label,
            filter,
            expected,
            policy,
            mode,
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    async fn execute(&self, plan: &ScanPlan) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut filter = plan.filter.clone();

        for _ in 0..PAGE_LIMIT {
            let mut policy = plan.policy.clone();
            if let ScanMode::Paged(size) = plan.mode {
                policy.max_records = size;
            }
            let handle = match self.executor.scan_partitions(policy, filter.clone(), SIM_NAMESPACE, None, &[]) {
                Ok(handle) => handle,
                Err(e) => {
                    outcome.rejected = Some(e);
                    break;
                }
            };
            let (mut recordset, task) = handle.into_parts();

            let mut page = Page::default();
            let stop_after = match plan.mode {
                ScanMode::Cancel(n) => Some(n),
                _ => None,
            };
            while stop_after.map_or(true, |n| page.records.len() < n) {
                match recordset.next_record().await {
                    Some(Ok(record)) => page.records.push(record.key.digest),
                    Some(Err(e)) => page.errors.push(e),
                    None => break,
                }
            }
            drop(recordset);

            match tokio::time::timeout(FINISH_TIMEOUT, task).await {
                Ok(Ok(summary)) => page.summary = Some(summary),
                Ok(Err(_)) | Err(_) => outcome.hung = true,
            }

            let next = match (&page.summary, plan.mode) {
                (Some(s), ScanMode::Paged(_)) if s.error.is_none() && !s.filter.is_done() => {
                    Some(s.filter.clone())
                }
                _ => None,
            };
            outcome.pages.push(page);
            match next {
                Some(f) => filter = f,
                None => break,
            }
        }

        outcome.outstanding = match &self.transport {
            Transport::Direct(pool) => pool.stats().outstanding(),
            Transport::Proxy(pool) => pool.stats().outstanding(),
        };
        outcome
    }

    // =========================================================================
    // Invariant checks
    // =========================================================================

    fn check(&mut self, plan: &ScanPlan, outcome: ScanOutcome) {
        let ctx = format!("scan {} ({}, {:?})", self.result.total_scans, plan.label, plan.mode);

        if let Some(err) = outcome.rejected {
            self.violation(format!("{}: rejected: {}", ctx, err));
            return;
        }
        if outcome.hung {
            self.violation(format!("{}: scan task did not finish", ctx));
            return;
        }
        if outcome.outstanding != 0 {
            self.violation(format!(
                "{}: {} connections still checked out",
                ctx, outcome.outstanding
            ));
        }

        let mut seen: HashSet<Digest> = HashSet::new();
        let mut failed = false;
        for (i, page) in outcome.pages.iter().enumerate() {
            for digest in &page.records {
                if !seen.insert(*digest) {
                    self.violation(format!("{}: page {} duplicate {:?}", ctx, i, digest));
                }
                if !plan.expected.contains(digest) {
                    self.violation(format!("{}: page {} unexpected {:?}", ctx, i, digest));
                }
            }
            self.result.records_delivered += page.records.len() as u64;

            let Some(summary) = &page.summary else { continue };
            self.result.rounds += u64::from(summary.iterations);
            if summary.iterations > self.config.max_retries + 1 {
                self.violation(format!(
                    "{}: {} rounds exceed retry budget",
                    ctx, summary.iterations
                ));
            }

            if page.errors.len() > 1 {
                self.violation(format!("{}: {} terminal errors", ctx, page.errors.len()));
            }
            if let Some(err) = page.errors.first() {
                failed = true;
                if !matches!(err, ScanError::MaxRetriesExceeded { .. }) {
                    self.violation(format!("{}: unexpected error {}", ctx, err));
                }
                if summary.error.as_ref() != Some(err) {
                    self.violation(format!("{}: summary error differs from recordset", ctx));
                }
            }

            if let ScanMode::Paged(size) = plan.mode {
                if page.records.len() as u64 > size {
                    self.violation(format!(
                        "{}: page {} returned {} records over cap {}",
                        ctx,
                        i,
                        page.records.len(),
                        size
                    ));
                }
            }
            if !matches!(plan.mode, ScanMode::Cancel(_)) && summary.record_count != page.records.len() as u64 {
                self.violation(format!(
                    "{}: page {} counted {} records, delivered {}",
                    ctx,
                    i,
                    summary.record_count,
                    page.records.len()
                ));
            }
        }

        if failed {
            self.result.failed_scans += 1;
            return;
        }

        match plan.mode {
            ScanMode::Cancel(_) => {
                self.result.cancelled_scans += 1;
                return;
            }
            ScanMode::Paged(_) => self.result.paged_scans += 1,
            ScanMode::Full => {}
        }

        let last = outcome.pages.last().and_then(|p| p.summary.as_ref());
        if !last.is_some_and(|s| s.complete && s.filter.is_done()) {
            self.violation(format!("{}: ended without error but not done", ctx));
            return;
        }
        if seen.len() != plan.expected.len() {
            self.violation(format!(
                "{}: delivered {} of {} records",
                ctx,
                seen.len(),
                plan.expected.len()
            ));
            return;
        }
        self.result.completed_scans += 1;
    }
}

/// Run a batch of DST tests with different seeds
pub fn run_scan_batch(
    start_seed: u64,
    num_seeds: usize,
    scans_per_seed: usize,
    config_fn: fn(u64) -> ScanDSTConfig,
) -> Vec<ScanDSTResult> {
    (0..num_seeds)
        .map(|i| {
            let seed = start_seed + i as u64;
            let mut harness = ScanDSTHarness::new(config_fn(seed));
            harness.run(scans_per_seed);
            harness.result().clone()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_scan_batch(results: &[ScanDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;
    let scans: u64 = results.iter().map(|r| r.total_scans).sum();
    let records: u64 = results.iter().map(|r| r.records_delivered).sum();

    let mut summary = format!(
        "Scan DST Summary\n\
         ================\n\
         Seeds: {} total, {} passed, {} failed\n\
         Scans: {}, records delivered: {}\n",
        total, passed, failed, scans, records
    );

    if failed > 0 {
        summary.push_str("\nFailed seeds:\n");
        for result in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("  {}\n", result.summary()));
            for violation in &result.invariant_violations {
                summary.push_str(&format!("    - {}\n", violation));
            }
        }
    }

    summary
}
