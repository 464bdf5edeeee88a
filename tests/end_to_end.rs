//! End-to-end scans through the public API
//!
//! Config comes from a TOML file, the cluster is simulated, and records are
//! consumed the way an application would: through the recordset stream.

use futures::StreamExt;
use kv_scan::sim::{sim_digest, SimCluster, SimConfig, SimFaults, SIM_NAMESPACE};
use kv_scan::{EngineConfig, PartitionFilter, Record, ScanError, ScanExecutor, Transport, Value};
use std::collections::HashSet;
use std::io::Write;

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn engine_config() -> EngineConfig {
    let file = write_config(
        r#"
        [cluster]
        partition_count = 4096

        [scan]
        max_retries = 5
        sleep_between_retries = 0
        socket_timeout = 5000
        record_queue_size = 256

        [pool]
        max_connections = 16

        [log]
        filter = "kv_scan=debug"
        "#,
    );
    EngineConfig::load(file.path()).unwrap()
}

async fn drain(
    executor: &ScanExecutor,
    filter: PartitionFilter,
    config: &EngineConfig,
) -> (Vec<Record>, Vec<ScanError>) {
    let handle = executor
        .scan_partitions(config.scan.clone(), filter, SIM_NAMESPACE, None, &[])
        .unwrap();
    let (recordset, task) = handle.into_parts();
    let items: Vec<_> = recordset.collect().await;
    task.await.unwrap();

    let mut records = Vec::new();
    let mut errors = Vec::new();
    for item in items {
        match item {
            Ok(r) => records.push(r),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

#[tokio::test]
async fn test_full_cluster_scan_direct() {
    let config = engine_config();
    let cluster = SimCluster::new(SimConfig::default(), 1);
    let executor = ScanExecutor::new(
        Transport::Direct(cluster.socket_pool(&config.pool)),
        cluster.partition_map(),
        config.cluster.clone(),
    );

    let (records, errors) = drain(&executor, PartitionFilter::all(), &config).await;

    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(records.len() as u64, cluster.config().total_records());
    let unique: HashSet<_> = records.iter().map(|r| r.key.digest).collect();
    assert_eq!(unique.len(), records.len());
    for node in cluster.nodes() {
        assert_eq!(node.requests(), 1);
    }
}

#[tokio::test]
async fn test_full_cluster_scan_proxy() {
    let config = engine_config();
    let cluster = SimCluster::new(SimConfig::default(), 1);
    let executor = ScanExecutor::new(
        Transport::Proxy(cluster.proxy_pool(&config.pool)),
        cluster.partition_map(),
        config.cluster.clone(),
    );

    let (records, errors) = drain(&executor, PartitionFilter::all(), &config).await;

    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(records.len() as u64, cluster.config().total_records());
    assert_eq!(cluster.proxy().iterations(), vec![1]);
}

#[tokio::test]
async fn test_records_carry_bins() {
    let config = engine_config();
    let cluster = SimCluster::new(SimConfig::default(), 1);
    let executor = ScanExecutor::new(
        Transport::Direct(cluster.socket_pool(&config.pool)),
        cluster.partition_map(),
        config.cluster.clone(),
    );

    let (records, _) = drain(&executor, PartitionFilter::by_id(77), &config).await;

    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.bins.get("partition"), Some(&Value::Int(77)));
        assert_eq!(record.key.set_name.as_deref(), Some("sim"));
        assert_eq!(&*record.key.namespace, SIM_NAMESPACE);
    }
}

#[tokio::test]
async fn test_resume_after_digest_and_by_keys() {
    let config = engine_config();
    let sim = SimConfig {
        records_per_partition: 5,
        ..SimConfig::default()
    };
    let cluster = SimCluster::new(sim, 1);
    let executor = ScanExecutor::new(
        Transport::Direct(cluster.socket_pool(&config.pool)),
        cluster.partition_map(),
        config.cluster.clone(),
    );

    let (records, _) =
        drain(&executor, PartitionFilter::after_digest(sim_digest(3000, 1)), &config).await;
    let digests: Vec<_> = records.iter().map(|r| r.key.digest).collect();
    assert_eq!(
        digests,
        vec![sim_digest(3000, 2), sim_digest(3000, 3), sim_digest(3000, 4)]
    );

    let keys = vec![sim_digest(10, 4), sim_digest(2500, 0)];
    let (records, _) = drain(&executor, PartitionFilter::by_keys(keys.clone()), &config).await;
    let got: HashSet<_> = records.iter().map(|r| r.key.digest).collect();
    assert_eq!(got, keys.into_iter().collect());
}

#[tokio::test]
async fn test_faulty_cluster_still_completes() {
    let mut config = engine_config();
    config.scan.base.max_retries = 100;
    let sim = SimConfig {
        faults: SimFaults {
            unavailable_probability: 0.05,
            drop_probability: 0.05,
        },
        migrate_on_unavailable: true,
        ..SimConfig::default()
    };
    let cluster = SimCluster::new(sim, 9);
    let executor = ScanExecutor::new(
        Transport::Direct(cluster.socket_pool(&config.pool)),
        cluster.partition_map(),
        config.cluster.clone(),
    );

    let (records, errors) = drain(&executor, PartitionFilter::all(), &config).await;

    assert!(errors.is_empty(), "{:?}", errors);
    let unique: HashSet<_> = records.iter().map(|r| r.key.digest).collect();
    assert_eq!(unique.len() as u64, cluster.config().total_records());
    assert_eq!(records.len(), unique.len());
    assert!(cluster.partition_map().migrations() > 0);
}

#[test]
fn test_invalid_config_rejected() {
    let file = write_config("[scan]\nrecord_queue_size = 0\n");
    assert!(EngineConfig::load(file.path()).is_err());
}
