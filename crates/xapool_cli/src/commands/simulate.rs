//! Simulate command implementation.

use super::{CliResult, Format};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use xapool_core::{
    DataSourceConfig, InMemoryDecisionLog, LocalTransactionManager, PoolStats, RecoveryManager,
    XaDataSourceWrapper, XaPoolWrapper,
};
use xapool_resource::InMemoryXaDataSource;

/// Outcome of a simulated workload.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Transactions committed.
    pub committed: usize,
    /// Transactions that failed and were rolled back.
    pub failed: usize,
    /// Writes visible on the resource afterwards.
    pub committed_writes: usize,
    /// Physical connections opened over the run.
    pub connections_opened: u64,
    /// Wall-clock time of the run.
    pub elapsed_millis: u128,
    /// Pool counters at the end of the run.
    pub pool: PoolStats,
}

/// Creates an in-memory resource matching `config`.
pub(crate) fn memory_source(config: &DataSourceConfig) -> InMemoryXaDataSource {
    let source = InMemoryXaDataSource::new(config.descriptor());
    if let Ok(Some(credentials)) = config.dedicated_recovery_credentials() {
        source.add_account(credentials);
    }
    source
}

/// Runs `transactions` transactions on each of `threads` clients.
///
/// Each transaction writes one row, releases its connection, and asks
/// for it again before committing, so every commit exercises connection
/// reuse within the transaction.
pub fn simulate(config: DataSourceConfig, threads: usize, transactions: usize) -> CliResult<SimulationReport> {
    let source = memory_source(&config);
    let tm = Arc::new(LocalTransactionManager::new(Arc::new(
        InMemoryDecisionLog::new(),
    )));
    let recovery = Arc::new(RecoveryManager::new(tm.clone()));
    let ds = XaPoolWrapper::new(tm.clone(), recovery, config)?.wrap_data_source(Arc::new(source.clone()))?;

    let committed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let started = Instant::now();

    thread::scope(|scope| {
        for client in 0..threads {
            let (tm, ds, committed, failed) = (&tm, &ds, &committed, &failed);
            scope.spawn(move || {
                for n in 0..transactions {
                    let txn = tm.begin();
                    let result = (|| {
                        let mut conn = ds.get_connection(Some(&txn))?;
                        conn.execute(&format!("insert into accounts values ({client}, {n})"))?;
                        drop(conn);
                        let mut conn = ds.get_connection(Some(&txn))?;
                        conn.execute(&format!("select * from accounts where client = {client}"))?;
                        drop(conn);
                        tm.commit(&txn)
                    })();

                    match result {
                        Ok(_) => {
                            committed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!(client, error = %e, "transaction failed");
                            let _ = tm.rollback(&txn);
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    let report = SimulationReport {
        committed: committed.into_inner(),
        failed: failed.into_inner(),
        committed_writes: source.committed_statements().len(),
        connections_opened: source.opened_connections(),
        elapsed_millis: started.elapsed().as_millis(),
        pool: ds.stats(),
    };
    ds.close();
    info!(committed = report.committed, failed = report.failed, "simulation finished");
    Ok(report)
}

/// Runs the simulate command.
pub fn run(config: DataSourceConfig, threads: usize, transactions: usize, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let report = simulate(config, threads, transactions)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!("Committed:           {}", report.committed);
            println!("Failed:              {}", report.failed);
            println!("Committed writes:    {}", report.committed_writes);
            println!("Connections opened:  {}", report.connections_opened);
            println!(
                "Elapsed:             {:?}",
                Duration::from_millis(u64::try_from(report.elapsed_millis).unwrap_or(u64::MAX))
            );
            println!(
                "Pool:                {} idle, {} active, {} borrows",
                report.pool.idle, report.pool.active, report.pool.borrowed
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xapool_resource::{Credentials, ResourceDescriptor, XaDataSource};

    #[test]
    fn every_transaction_commits_one_write() {
        let config = DataSourceConfig::new("memory://sim", "app", "secret").max_total(2);
        let report = simulate(config, 3, 10).unwrap();
        assert_eq!(report.committed, 30);
        assert_eq!(report.failed, 0);
        assert_eq!(report.committed_writes, 30);
        assert!(report.connections_opened <= 2);
        assert_eq!(report.pool.active, 0);
    }

    #[test]
    fn memory_source_accepts_recovery_account() {
        let config = DataSourceConfig::new("memory://sim", "app", "secret").recovery_credentials("recover", "r3c");
        let source = memory_source(&config);
        assert!(source.connect(&Credentials::new("recover", "r3c")).is_ok());
    }

    #[test]
    fn descriptor_matches_config() {
        let config = DataSourceConfig::new("memory://sim", "app", "secret");
        let expected = ResourceDescriptor::new("memory://sim", Credentials::new("app", "secret"));
        assert_eq!(memory_source(&config).descriptor(), &expected);
    }
}
