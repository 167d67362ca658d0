//! Stress helpers for xapool.
//!
//! These run workloads from many threads against a shared data source and
//! report how long borrowers waited for connections.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use xapool_core::{CoreError, LocalTransactionManager, ManagedDataSource, PoolStats};

/// What happened to one operation of a stress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation got a connection after `waited` and finished.
    Completed {
        /// Time spent waiting for the connection.
        waited: Duration,
    },
    /// The borrow gave up after `waited` with `PoolExhausted`.
    TimedOut {
        /// Time spent waiting before giving up.
        waited: Duration,
    },
    /// The operation got a connection but its transaction did not commit.
    Aborted,
}

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Operations that got a connection and finished.
    pub completed: usize,
    /// Borrows that timed out.
    pub timed_out: usize,
    /// Transactions that failed to commit.
    pub aborted: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Mean time borrowers waited for a connection.
    pub mean_wait: Duration,
    /// Longest time a borrower waited for a connection.
    pub max_wait: Duration,
    /// Pool counters after the run.
    pub stats: PoolStats,
}

impl StressTestResult {
    /// Returns the number of operations attempted.
    pub fn total_ops(&self) -> usize {
        self.completed + self.timed_out + self.aborted
    }

    /// Returns completed operations per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Operations: {}", self.total_ops());
        println!("Completed: {}", self.completed);
        println!("Timed out: {}", self.timed_out);
        println!("Aborted: {}", self.aborted);
        println!("Wait: mean {:?}, max {:?}", self.mean_wait, self.max_wait);
        println!(
            "Pool: {} created, {} destroyed, {} idle",
            self.stats.created, self.stats.destroyed, self.stats.idle
        );
        println!("Throughput: {:.2} ops/sec", self.throughput());
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Operations per thread.
    pub operations_per_thread: usize,
    /// How long a borrower holds its connection.
    pub hold: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            operations_per_thread: 200,
            hold: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Tally {
    completed: AtomicUsize,
    timed_out: AtomicUsize,
    aborted: AtomicUsize,
    waits: AtomicUsize,
    wait_nanos: AtomicU64,
    max_wait_nanos: AtomicU64,
}

impl Tally {
    fn record_wait(&self, waited: Duration) {
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_wait_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn record(&self, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Completed { waited } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.record_wait(waited);
            }
            OpOutcome::TimedOut { waited } => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.record_wait(waited);
            }
            OpOutcome::Aborted => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn run_threads<F>(ds: &ManagedDataSource, config: &StressConfig, op: F) -> StressTestResult
where
    F: Fn(usize, usize) -> OpOutcome + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let tally = Arc::new(Tally::default());
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let op = Arc::clone(&op);
            let tally = Arc::clone(&tally);
            let operations = config.operations_per_thread;

            thread::spawn(move || {
                for i in 0..operations {
                    tally.record(op(t, i));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }
    let duration = start.elapsed();

    let waits = tally.waits.load(Ordering::Relaxed) as u64;
    let mean_wait = match waits {
        0 => Duration::ZERO,
        n => Duration::from_nanos(tally.wait_nanos.load(Ordering::Relaxed) / n),
    };
    StressTestResult {
        completed: tally.completed.load(Ordering::Relaxed),
        timed_out: tally.timed_out.load(Ordering::Relaxed),
        aborted: tally.aborted.load(Ordering::Relaxed),
        duration,
        mean_wait,
        max_wait: Duration::from_nanos(tally.max_wait_nanos.load(Ordering::Relaxed)),
        stats: ds.stats(),
    }
}

/// Borrows, uses and releases connections outside transactions.
///
/// Borrow timeouts are counted; any other error, or a statement failing
/// on a borrowed connection, panics.
pub fn stress_borrow_release(ds: Arc<ManagedDataSource>, config: &StressConfig) -> StressTestResult {
    let hold = config.hold;
    let shared = Arc::clone(&ds);
    run_threads(&ds, config, move |t, i| {
        let started = Instant::now();
        match shared.get_connection(None) {
            Ok(mut conn) => {
                let waited = started.elapsed();
                conn.execute(&format!("select {t}, {i}"))
                    .expect("Statement failed");
                if !hold.is_zero() {
                    thread::sleep(hold);
                }
                OpOutcome::Completed { waited }
            }
            Err(e) => {
                assert!(e.is_pool_exhausted(), "unexpected error: {e}");
                OpOutcome::TimedOut {
                    waited: started.elapsed(),
                }
            }
        }
    })
}

/// Runs short transactions asking twice for a connection each.
///
/// Each completed transaction commits exactly one write.
pub fn stress_transactions(
    tm: Arc<LocalTransactionManager>,
    ds: Arc<ManagedDataSource>,
    config: &StressConfig,
) -> StressTestResult {
    let shared = Arc::clone(&ds);
    run_threads(&ds, config, move |t, i| {
        let txn = tm.begin();
        let started = Instant::now();
        let outcome = (|| {
            let mut conn = shared.get_connection(Some(&txn))?;
            let waited = started.elapsed();
            conn.execute(&format!("insert into t values ({t}, {i})"))?;
            drop(conn);
            // second request reuses the enlisted connection
            let mut conn = shared.get_connection(Some(&txn))?;
            conn.execute(&format!("select {t}, {i}"))?;
            Ok::<_, CoreError>(waited)
        })();

        match outcome {
            Ok(waited) => match tm.commit(&txn) {
                Ok(_) => OpOutcome::Completed { waited },
                Err(_) => OpOutcome::Aborted,
            },
            Err(e) => {
                assert!(e.is_pool_exhausted(), "unexpected error: {e}");
                tm.rollback(&txn).expect("Rollback failed");
                OpOutcome::TimedOut {
                    waited: started.elapsed(),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_config, TestEnv};
    use crate::integration::wait_until;

    #[test]
    fn tally_tracks_waits() {
        let tally = Tally::default();
        tally.record(OpOutcome::Completed {
            waited: Duration::from_millis(2),
        });
        tally.record(OpOutcome::TimedOut {
            waited: Duration::from_millis(6),
        });
        tally.record(OpOutcome::Aborted);

        assert_eq!(tally.completed.load(Ordering::Relaxed), 1);
        assert_eq!(tally.timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(tally.aborted.load(Ordering::Relaxed), 1);
        assert_eq!(tally.waits.load(Ordering::Relaxed), 2);
        assert_eq!(
            tally.max_wait_nanos.load(Ordering::Relaxed),
            Duration::from_millis(6).as_nanos() as u64
        );
    }

    #[test]
    fn borrowers_never_exceed_max_total() {
        let env = TestEnv::new(test_config().max_total(3).max_wait(Duration::from_secs(5)));
        let TestEnv { source, ds, .. } = env;
        let ds = Arc::new(ds);

        let result = stress_borrow_release(
            Arc::clone(&ds),
            &StressConfig {
                threads: 8,
                operations_per_thread: 50,
                hold: Duration::from_micros(200),
            },
        );
        result.print_summary("borrow/release");

        assert_eq!(result.completed, 400);
        assert_eq!(result.timed_out, 0);
        assert!(result.max_wait < Duration::from_secs(5));
        assert!(source.opened_connections() <= 3);
        assert_eq!(result.stats.active, 0);
        assert_eq!(result.stats.borrowed, 400);
    }

    #[test]
    fn short_timeouts_fail_cleanly_under_contention() {
        let env = TestEnv::new(test_config().max_total(1).max_wait(Duration::from_millis(1)));
        let TestEnv { ds, .. } = env;
        let ds = Arc::new(ds);

        let result = stress_borrow_release(
            Arc::clone(&ds),
            &StressConfig {
                threads: 4,
                operations_per_thread: 50,
                hold: Duration::from_millis(1),
            },
        );

        assert_eq!(result.total_ops(), 200);
        assert!(result.completed > 0);
        assert!(result.max_wait >= result.mean_wait);
        assert_eq!(result.stats.active, 0);
        assert_eq!(result.stats.waiters, 0);
        assert!(result.stats.total <= 1);
    }

    #[test]
    fn transactional_load_commits_every_write() {
        let env = TestEnv::new(test_config().max_total(4));
        let TestEnv { source, tm, ds, .. } = env;
        let ds = Arc::new(ds);

        let result = stress_transactions(tm.clone(), Arc::clone(&ds), &StressConfig::default());
        result.print_summary("transactions");

        assert_eq!(result.completed, 8 * 200);
        assert_eq!(result.timed_out + result.aborted, 0);
        assert_eq!(source.committed_statements().len(), 8 * 200);
        assert_eq!(tm.active_count(), 0);
        assert!(result.stats.total <= 4);
        assert_eq!(result.stats.active, 0);
        assert!(ds.transaction_registry().active_transactions().is_empty());
    }

    #[test]
    fn background_eviction_never_touches_loaned_connections() {
        let mut config = test_config()
            .max_total(4)
            .max_wait(Duration::from_secs(5))
            .max_idle(Duration::from_millis(1))
            .eviction_interval(Duration::from_millis(1));
        config.test_while_idle = true;
        let env = TestEnv::new(config);
        let TestEnv { source, ds, .. } = env;
        let ds = Arc::new(ds);

        // every statement on a loaned connection must succeed, so the
        // evictor closing one under a borrower panics the run
        let result = stress_borrow_release(
            Arc::clone(&ds),
            &StressConfig {
                threads: 8,
                operations_per_thread: 100,
                hold: Duration::from_micros(500),
            },
        );
        result.print_summary("borrow/release with eviction");

        assert_eq!(result.completed, 800);
        assert_eq!(result.timed_out, 0);
        assert_eq!(result.stats.active, 0);

        // idle connections expire once borrowers stop
        assert!(wait_until(Duration::from_secs(5), || ds.stats().total == 0));
        let stats = ds.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.destroyed > 0);
        // only idle connections were destroyed, and each exactly once
        assert_eq!(stats.destroyed, stats.created - stats.total as u64);
        assert_eq!(source.open_connections(), stats.total);
        assert_eq!(source.opened_connections(), stats.created);
        ds.close();
    }

    #[test]
    fn eviction_and_transactions_interleave() {
        let env = TestEnv::new(
            test_config()
                .max_total(3)
                .max_wait(Duration::from_secs(5))
                .max_idle(Duration::from_millis(1))
                .eviction_interval(Duration::from_millis(1)),
        );
        let TestEnv { source, tm, ds, .. } = env;
        let ds = Arc::new(ds);

        let config = StressConfig {
            threads: 6,
            operations_per_thread: 50,
            hold: Duration::ZERO,
        };
        let result = stress_transactions(tm.clone(), Arc::clone(&ds), &config);

        assert_eq!(result.completed, 300);
        assert_eq!(source.committed_statements().len(), 300);
        assert!(source.prepared_xids().is_empty());
        assert_eq!(tm.active_count(), 0);
        assert_eq!(result.stats.active, 0);
        ds.close();
    }
}
