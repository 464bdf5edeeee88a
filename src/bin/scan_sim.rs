//! Scan Simulator
//!
//! Runs a full partition scan against an in-memory cluster over both
//! transports and prints what came back.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | KV_SCAN_CONFIG | (none) | Path to a TOML engine config |
//! | KV_SCAN_SEED | 42 | Seed for the simulated cluster's fault schedule |
//! | KV_SCAN_NODES | 2 | Number of simulated nodes |
//! | KV_SCAN_FAULTS | 0.0 | Unavailable/drop probability per partition/frame |
//! | KV_SCAN_LOG | info | Log filter directive |
//! | KV_SCAN_LOG_FORMAT | pretty | `pretty` or `json` |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use kv_scan::observability::init_tracing;
use kv_scan::sim::{SimCluster, SimConfig, SimFaults, SIM_NAMESPACE};
use kv_scan::{EngineConfig, PartitionFilter, ScanExecutor, Transport};
use std::time::Instant;
use tracing::info;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("KV_SCAN_CONFIG") {
        Ok(path) => EngineConfig::load(path)?,
        Err(_) => EngineConfig::default(),
    };
    init_tracing(&config.log.clone().with_env_overrides());

    let seed: u64 = env_or("KV_SCAN_SEED", 42);
    let fault_rate: f64 = env_or("KV_SCAN_FAULTS", 0.0);
    let sim_config = SimConfig {
        node_count: env_or("KV_SCAN_NODES", 2),
        partition_count: config.cluster.partition_count,
        faults: SimFaults {
            unavailable_probability: fault_rate,
            drop_probability: fault_rate,
        },
        ..SimConfig::default()
    };
    let cluster = SimCluster::new(sim_config.clone(), seed);

    println!("Scan Simulator");
    println!("==============");
    println!(
        "{} nodes, {} partitions, {} records, fault rate {}",
        sim_config.node_count,
        sim_config.partition_count,
        sim_config.total_records(),
        fault_rate
    );
    println!();

    let transports = [
        ("direct", Transport::Direct(cluster.socket_pool(&config.pool))),
        ("proxy", Transport::Proxy(cluster.proxy_pool(&config.pool))),
    ];

    for (name, transport) in transports {
        let executor = ScanExecutor::new(transport, cluster.partition_map(), config.cluster.clone());
        let started = Instant::now();
        let mut handle = executor.scan_partitions(
            config.scan.clone(),
            PartitionFilter::all(),
            SIM_NAMESPACE,
            None,
            &[],
        )?;

        let mut records = 0u64;
        let mut failure = None;
        while let Some(item) = handle.recordset.next_record().await {
            match item {
                Ok(_) => records += 1,
                Err(e) => failure = Some(e),
            }
        }
        let summary = handle.finish().await?;
        info!(
            "{} scan finished: {} records in {} rounds",
            name, summary.record_count, summary.iterations
        );

        println!("[{}]", name);
        println!("  records:    {}", records);
        println!("  rounds:     {}", summary.iterations);
        println!("  complete:   {}", summary.complete);
        println!("  elapsed:    {:?}", started.elapsed());
        println!("  cursor:     {} bytes", summary.filter.to_json()?.len());
        if let Some(e) = failure {
            println!("  error:      {}", e);
        }
        println!();
    }

    Ok(())
}
