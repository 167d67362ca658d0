//! Recover command implementation.

use super::simulate::memory_source;
use super::{CliResult, Format};
use std::sync::Arc;
use tracing::info;
use xapool_core::{
    CoreError, DataSourceConfig, DecisionLog, InMemoryDecisionLog, LocalTransactionManager,
    RecoveryManager, RecoveryReport, XaDataSourceWrapper, XaPoolWrapper, FORMAT_ID,
};
use xapool_resource::{InMemoryXaDataSource, XaDataSource, Xid};

/// Leaves `decided` committed-but-unfinished and `orphaned` undecided
/// branches on a fresh resource, crashes it, and runs one recovery pass.
pub fn simulate_crash(
    config: DataSourceConfig,
    decided: usize,
    orphaned: usize,
) -> CliResult<(RecoveryReport, InMemoryXaDataSource)> {
    let source = memory_source(&config);
    let log = Arc::new(InMemoryDecisionLog::new());
    let tm = Arc::new(LocalTransactionManager::new(log.clone()));
    let recovery = Arc::new(RecoveryManager::new(log.clone()));
    let credentials = config.credentials();
    XaPoolWrapper::new(tm, recovery.clone(), config)?.wrap_data_source(Arc::new(source.clone()))?;

    for n in 0..decided + orphaned {
        let gtrid = format!("crashed-{n}");
        let xid = Xid::new(FORMAT_ID, gtrid.as_bytes(), &[1]).map_err(CoreError::from)?;

        let mut conn = source.connect(&credentials).map_err(CoreError::from)?;
        let xa = conn.xa_resource();
        let prepared = xa
            .start(&xid)
            .and_then(|()| conn.execute(&format!("insert into ledger values ({n})")))
            .and_then(|_| xa.end(&xid, true))
            .and_then(|()| xa.prepare(&xid));
        let _ = conn.close();
        prepared.map_err(CoreError::from)?;

        if n < decided {
            log.record_commit(gtrid.as_bytes());
        }
    }
    source.crash();
    info!(in_doubt = source.prepared_xids().len(), "resource crashed");

    Ok((recovery.scan(), source))
}

/// Runs the recover command.
pub fn run(config: DataSourceConfig, decided: usize, orphaned: usize, format: &str) -> CliResult<()> {
    let format = Format::parse(format)?;
    let (report, source) = simulate_crash(config, decided, orphaned)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            println!("Helpers scanned:  {}", report.helpers_scanned);
            println!("Committed:        {}", report.committed);
            println!("Rolled back:      {}", report.rolled_back);
            println!("Skipped:          {}", report.skipped);
            println!("Failures:         {}", report.failures);
            println!("Still in doubt:   {}", source.prepared_xids().len());
        }
    }
    Ok(())
}
