//! Stress tests for TalkVault.
//!
//! These helpers hammer a [`TransactionCoordinator`] from many threads and
//! report whether writers were exclusive and readers overlapped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use talkvault_core::settings::Settings;
use talkvault_core::{CoreResult, TransactionCoordinator};

/// Settings namespace the stress helpers write to.
pub const STRESS_NAMESPACE: &str = "stress";

const COUNTER_KEY: &str = "counter";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total transactions attempted.
    pub total_ops: usize,
    /// Transactions that committed (or, for readers, completed).
    pub successful_ops: usize,
    /// Transactions that failed.
    pub failed_ops: usize,
    /// Most transactions observed inside their critical section at once.
    pub max_concurrent: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    fn new(successful: usize, failed: usize, max_concurrent: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + failed,
            successful_ops: successful,
            failed_ops: failed,
            max_concurrent,
            duration,
        }
    }

    /// Transactions per second.
    #[must_use]
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total transactions: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Max concurrent: {}", self.max_concurrent);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} txn/sec", self.ops_per_second());
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Transactions each thread runs.
    pub transactions_per_thread: usize,
    /// How long each transaction stays open.
    pub hold: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions_per_thread: 25,
            hold: Duration::from_millis(1),
        }
    }
}

/// Tracks how many threads are inside a section and the peak.
#[derive(Debug, Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) -> usize {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        now
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Reads the counter written by [`stress_exclusive_writers`].
///
/// # Errors
///
/// Returns an error if the read transaction fails.
pub fn read_counter(coordinator: &TransactionCoordinator) -> CoreResult<i64> {
    coordinator.transaction_with_result(true, |txn| {
        Ok(txn.get_settings(STRESS_NAMESPACE)?.get_long(COUNTER_KEY, 0))
    })
}

/// Runs read-modify-write increments of one counter from many threads.
///
/// With exclusive writers no increment is lost, so the counter grows by
/// exactly `successful_ops` and `max_concurrent` is 1.
pub fn stress_exclusive_writers(
    coordinator: &Arc<TransactionCoordinator>,
    config: &StressConfig,
) -> StressTestResult {
    let occupancy = Arc::new(Occupancy::default());
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let coordinator = Arc::clone(coordinator);
            let occupancy = Arc::clone(&occupancy);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                for _ in 0..config.transactions_per_thread {
                    let outcome = coordinator.transaction(false, |txn| {
                        occupancy.enter();
                        let value = txn.get_settings(STRESS_NAMESPACE)?.get_long(COUNTER_KEY, 0);
                        thread::sleep(config.hold);
                        let mut s = Settings::new();
                        s.put_long(COUNTER_KEY, value + 1);
                        let merged = txn.merge_settings(&s, STRESS_NAMESPACE);
                        occupancy.leave();
                        merged
                    });
                    match outcome {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        occupancy.peak(),
        start.elapsed(),
    )
}

/// Opens read transactions from many threads, each waiting inside its
/// transaction until all threads are in or `timeout` passes.
///
/// `max_concurrent` equals `threads` when read transactions overlap.
pub fn stress_concurrent_readers(
    coordinator: &Arc<TransactionCoordinator>,
    threads: usize,
    timeout: Duration,
) -> StressTestResult {
    let occupancy = Arc::new(Occupancy::default());
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let coordinator = Arc::clone(coordinator);
            let occupancy = Arc::clone(&occupancy);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                let outcome = coordinator.transaction(true, |txn| {
                    txn.get_settings(STRESS_NAMESPACE)?;
                    occupancy.enter();
                    let deadline = Instant::now() + timeout;
                    while occupancy.peak() < threads && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                    }
                    occupancy.leave();
                    Ok::<(), talkvault_core::CoreError>(())
                });
                match outcome {
                    Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        occupancy.peak(),
        start.elapsed(),
    )
}

/// Runs writers and readers together and counts reads that overlapped a
/// write.
///
/// Returns the writer result and the number of overlapping reads, which is
/// zero when a writer excludes readers.
pub fn stress_readers_during_writes(
    coordinator: &Arc<TransactionCoordinator>,
    config: &StressConfig,
) -> (StressTestResult, usize) {
    let writing = Arc::new(Occupancy::default());
    let overlaps = Arc::new(AtomicUsize::new(0));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for i in 0..config.threads * 2 {
        let coordinator = Arc::clone(coordinator);
        let writing = Arc::clone(&writing);
        let overlaps = Arc::clone(&overlaps);
        let successful = Arc::clone(&successful);
        let failed = Arc::clone(&failed);
        let config = config.clone();
        let writer = i % 2 == 0;
        handles.push(thread::spawn(move || {
            for _ in 0..config.transactions_per_thread {
                let outcome = coordinator.transaction(!writer, |txn| {
                    if writer {
                        writing.enter();
                        thread::sleep(config.hold);
                        let mut s = Settings::new();
                        s.put_long(COUNTER_KEY, 1);
                        let merged = txn.merge_settings(&s, STRESS_NAMESPACE);
                        writing.leave();
                        merged
                    } else {
                        if writing.current() > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(())
                    }
                });
                if writer {
                    match outcome {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    (
        StressTestResult::new(
            successful.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
            writing.peak(),
            start.elapsed(),
        ),
        overlaps.load(Ordering::SeqCst),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    #[test]
    fn writers_never_overlap() {
        let store = TestStore::memory();
        store.open().unwrap();
        let config = StressConfig::default();

        let result = stress_exclusive_writers(&store.coordinator, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.max_concurrent, 1);
        assert_eq!(
            read_counter(&store.coordinator).unwrap(),
            (config.threads * config.transactions_per_thread) as i64
        );
    }

    #[test]
    fn readers_overlap() {
        let store = TestStore::memory();
        store.open().unwrap();
        let result = stress_concurrent_readers(&store.coordinator, 4, Duration::from_secs(5));
        assert_eq!(result.successful_ops, 4);
        assert_eq!(result.max_concurrent, 4);
    }

    #[test]
    fn readers_wait_for_writers() {
        let store = TestStore::memory();
        store.open().unwrap();
        let config = StressConfig {
            threads: 2,
            transactions_per_thread: 20,
            hold: Duration::from_millis(2),
        };
        let (writes, overlaps) = stress_readers_during_writes(&store.coordinator, &config);
        assert_eq!(writes.failed_ops, 0);
        assert_eq!(overlaps, 0);
    }
}
