//! Stress tests for OffsetDB.
//!
//! These helpers verify behavior under heavy load and concurrent access.
//! Writers rewrite every key in every version, so a consistent snapshot is
//! one where all keys carry the version that was read.

use crate::fixtures::TestPart;
use offsetdb_core::OffsetIndex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent reader threads.
    pub threads: usize,
    /// Number of distinct keys.
    pub key_count: i64,
    /// Writes between flushes in the sequential tests.
    pub flush_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            key_count: 100,
            flush_every: 100,
        }
    }
}

/// Run a sequential write stress test. Each write uses its own version.
pub fn stress_sequential_writes(
    index: &OffsetIndex<TestPart>,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let version = i as u64 + 1;
        let id = i as i64 % config.key_count;

        match index.put(version, TestPart::price(id, version)) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
        if (i + 1) % config.flush_every == 0 && index.flush(version).is_err() {
            failed += 1;
        }
    }
    if index.flush(config.operations as u64).is_err() {
        failed += 1;
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequential read stress test against a populated index.
pub fn stress_sequential_reads(
    index: &OffsetIndex<TestPart>,
    config: &StressConfig,
) -> StressTestResult {
    for id in 0..config.key_count {
        let _ = index.put(1, TestPart::price(id, 1));
    }
    let _ = index.flush(1);

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let id = i as i64 % config.key_count;
        match index.get(1, TestPart::price_key(id)) {
            Ok(Some(TestPart::Price { cents: 1, .. })) => successful += 1,
            _ => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Writes every key at `version` and flushes it.
fn write_generation(index: &OffsetIndex<TestPart>, key_count: i64, version: u64) -> bool {
    (0..key_count).all(|id| index.put(version, TestPart::price(id, version)).is_ok())
        && index.flush(version).is_ok()
}

/// Readers take snapshots at flushed versions while a writer keeps
/// flushing new ones. A snapshot fails if any key carries another version.
///
/// `config.operations` is the number of versions written.
pub fn stress_readers_during_flushes(
    index: &OffsetIndex<TestPart>,
    config: &StressConfig,
) -> StressTestResult {
    let key_count = config.key_count;
    if !write_generation(index, key_count, 1) {
        return StressTestResult::new(0, 1, Duration::ZERO);
    }

    let flushed = AtomicU64::new(1);
    let done = AtomicBool::new(false);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let (flushed, done, successful, failed) = (&flushed, &done, &successful, &failed);
            scope.spawn(move || {
                let mut last_seen = 0u64;
                let mut round = t as u64;
                while !done.load(Ordering::Acquire) {
                    let latest = flushed.load(Ordering::Acquire);
                    // every other round reads one version back, through history
                    let version = if round % 2 == 0 || latest == 1 {
                        latest
                    } else {
                        latest - 1
                    };
                    round += 1;

                    let consistent = (0..key_count).all(|id| {
                        matches!(
                            index.get(version, TestPart::price_key(id)),
                            Ok(Some(TestPart::Price { cents, .. })) if cents == version
                        )
                    });
                    if consistent && latest >= last_seen {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    last_seen = latest;
                }
            });
        }

        for version in 2..=(config.operations as u64 + 1) {
            if write_generation(index, key_count, version) {
                flushed.store(version, Ordering::Release);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        done.store(true, Ordering::Release);
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestIndex;

    #[test]
    fn test_sequential_writes() {
        let index = TestIndex::new();
        let config = StressConfig {
            operations: 1_000,
            key_count: 50,
            flush_every: 100,
            ..Default::default()
        };

        let result = stress_sequential_writes(&index, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 1_000);
        assert_eq!(index.count(1_000).unwrap(), 50);
    }

    #[test]
    fn test_sequential_reads() {
        let index = TestIndex::new();
        let config = StressConfig {
            operations: 1_000,
            key_count: 100,
            ..Default::default()
        };

        let result = stress_sequential_reads(&index, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_readers_during_flushes() {
        let index = TestIndex::new();
        let config = StressConfig {
            operations: 40,
            threads: 3,
            key_count: 20,
            ..Default::default()
        };

        let result = stress_readers_during_flushes(&index, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(index.latest_version(), 41);
    }
}
