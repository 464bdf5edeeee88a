//! Scan Deterministic Simulation Tests
//!
//! DST tests for ScanExecutor with multiple seeds. Each seed runs a sequence
//! of scans against a simulated cluster and checks exactly-once delivery,
//! completeness and connection accounting after every scan.

use kv_scan::sim::{run_scan_batch, summarize_scan_batch, ScanDSTConfig, ScanDSTHarness};

// =============================================================================
// Calm Tests - No Faults
// =============================================================================

#[test]
fn test_scan_dst_calm_50_seeds() {
    let results = run_scan_batch(0, 50, 10, ScanDSTConfig::calm);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All 50 calm seeds should pass");
    assert!(results.iter().all(|r| r.failed_scans == 0));
}

// =============================================================================
// Moderate Tests - Occasional Unavailable Partitions and Dropped Connections
// =============================================================================

#[test]
fn test_scan_dst_moderate_50_seeds() {
    let results = run_scan_batch(0, 50, 20, ScanDSTConfig::new);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All 50 moderate seeds should pass");
}

#[test]
fn test_scan_dst_proxy_50_seeds() {
    let results = run_scan_batch(1000, 50, 20, ScanDSTConfig::proxy);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 50, "All 50 proxy seeds should pass");
}

// =============================================================================
// Chaos Tests - Frequent Faults and Ownership Migration
// =============================================================================

#[test]
fn test_scan_dst_chaos_25_seeds() {
    let results = run_scan_batch(0, 25, 20, ScanDSTConfig::chaos);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 25, "All 25 chaos seeds should pass");
}

#[test]
fn test_scan_dst_chaos_proxy_25_seeds() {
    fn chaos_proxy(seed: u64) -> ScanDSTConfig {
        ScanDSTConfig {
            proxy: true,
            ..ScanDSTConfig::chaos(seed)
        }
    }

    let results = run_scan_batch(500, 25, 20, chaos_proxy);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 25, "All 25 chaos proxy seeds should pass");
}

// =============================================================================
// Stress Tests - Long Scan Sequences
// =============================================================================

#[test]
fn test_scan_dst_stress_200_scans() {
    let mut harness = ScanDSTHarness::with_seed(42);
    harness.run(200);
    let result = harness.result();
    println!("Stress 200 scans: {}", result.summary());
    assert!(result.is_success(), "{:?}", result.invariant_violations);
}

#[test]
fn test_scan_dst_tight_retry_budget() {
    fn tight(seed: u64) -> ScanDSTConfig {
        ScanDSTConfig {
            max_retries: 1,
            ..ScanDSTConfig::chaos(seed)
        }
    }

    // Failures are allowed here; duplicates, stray records and leaked
    // connections are not.
    let results = run_scan_batch(0, 25, 10, tight);
    let summary = summarize_scan_batch(&results);
    println!("{}", summary);

    let passed = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(passed, 25, "All 25 tight-budget seeds should pass");
    assert!(results.iter().any(|r| r.failed_scans > 0));
}
