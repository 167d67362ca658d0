//! Test fixtures and environment helpers.
//!
//! Provides a fully wired environment over an in-memory XA resource and
//! helpers for common scenarios.

use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use xapool_core::{
    DataSourceConfig, InMemoryDecisionLog, LocalTransactionManager, ManagedDataSource,
    RecoveryManager, XaDataSourceWrapper, XaPoolWrapper, FORMAT_ID,
};
use xapool_resource::{Credentials, InMemoryXaDataSource, ResourceDescriptor, XaDataSource, Xid};

/// Endpoint of the default test resource.
pub const ENDPOINT: &str = "memory://db1";
/// Primary user of the test resources.
pub const USER: &str = "app";
/// Primary password of the test resources.
pub const PASSWORD: &str = "secret";

/// Returns the default configuration for [`ENDPOINT`].
pub fn test_config() -> DataSourceConfig {
    DataSourceConfig::new(ENDPOINT, USER, PASSWORD)
}

/// Creates an in-memory resource accepting [`USER`] / [`PASSWORD`].
pub fn memory_source(endpoint: &str) -> InMemoryXaDataSource {
    InMemoryXaDataSource::new(ResourceDescriptor::new(
        endpoint,
        Credentials::new(USER, PASSWORD),
    ))
}

/// A wired test environment.
pub struct TestEnv {
    /// The in-memory resource behind the data source.
    pub source: InMemoryXaDataSource,
    /// The transaction manager.
    pub tm: Arc<LocalTransactionManager>,
    /// The recovery manager, resolving against the transaction manager.
    pub recovery: Arc<RecoveryManager>,
    /// The managed data source.
    pub ds: ManagedDataSource,
}

impl TestEnv {
    /// Creates an environment for `config`.
    ///
    /// The resource is created for the configured endpoint and accepts
    /// the configured recovery account, if any.
    pub fn new(config: DataSourceConfig) -> Self {
        let source = memory_source(&config.resource_endpoint);
        if let Some(credentials) = config
            .dedicated_recovery_credentials()
            .expect("Invalid recovery credentials")
        {
            source.add_account(credentials);
        }

        let tm = Arc::new(LocalTransactionManager::new(Arc::new(
            InMemoryDecisionLog::new(),
        )));
        let recovery = Arc::new(RecoveryManager::new(tm.clone()));
        let ds = XaPoolWrapper::new(tm.clone(), recovery.clone(), config)
            .expect("Invalid configuration")
            .wrap_data_source(Arc::new(source.clone()))
            .expect("Failed to wrap data source");

        Self {
            source,
            tm,
            recovery,
            ds,
        }
    }

    /// Wraps a second resource with the same managers.
    pub fn add_resource(&self, endpoint: &str) -> (InMemoryXaDataSource, ManagedDataSource) {
        let source = memory_source(endpoint);
        let ds = XaPoolWrapper::new(
            self.tm.clone(),
            self.recovery.clone(),
            DataSourceConfig::new(endpoint, USER, PASSWORD),
        )
        .expect("Invalid configuration")
        .wrap_data_source(Arc::new(source.clone()))
        .expect("Failed to wrap data source");
        (source, ds)
    }
}

impl std::ops::Deref for TestEnv {
    type Target = ManagedDataSource;

    fn deref(&self) -> &Self::Target {
        &self.ds
    }
}

/// Runs a test with a fresh environment.
pub fn with_env<F, R>(config: DataSourceConfig, f: F) -> R
where
    F: FnOnce(&TestEnv) -> R,
{
    let env = TestEnv::new(config);
    f(&env)
}

/// Returns an XID in this crate's format.
pub fn coordinator_xid(gtrid: &[u8], branch: u32) -> Xid {
    Xid::new(FORMAT_ID, gtrid, &branch.to_be_bytes()).expect("Invalid XID")
}

/// Leaves a prepared branch on `source`, as a coordinator crashing after
/// prepare would.
pub fn leave_in_doubt(source: &InMemoryXaDataSource, xid: &Xid, statement: &str) {
    let mut conn = source
        .connect(&Credentials::new(USER, PASSWORD))
        .expect("Failed to connect");
    let xa = conn.xa_resource();
    xa.start(xid).expect("Failed to start branch");
    conn.execute(statement).expect("Failed to execute");
    xa.end(xid, true).expect("Failed to end branch");
    xa.prepare(xid).expect("Failed to prepare branch");
    conn.close().expect("Failed to close");
}

/// Writes a JSON configuration file.
pub fn config_file(config: &serde_json::Value) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    serde_json::to_writer_pretty(&mut file, config).expect("Failed to write config");
    file.flush().expect("Failed to flush config");
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn env_is_wired() {
        with_env(test_config(), |env| {
            assert_eq!(env.resource_key(), ENDPOINT);
            assert!(env.recovery.is_registered(ENDPOINT));
            assert!(env.get_connection(None).is_ok());
        });
    }

    #[test]
    fn env_accepts_recovery_account() {
        let env = TestEnv::new(test_config().recovery_credentials("recover", "r3c"));
        env.recovery.scan();
        assert_eq!(env.source.logins(), vec!["recover"]);
    }

    #[test]
    fn second_resource_shares_managers() {
        let env = TestEnv::new(test_config());
        let (_, ds) = env.add_resource("memory://db2");
        assert_eq!(ds.resource_key(), "memory://db2");
        assert_eq!(env.recovery.helper_count(), 2);
    }

    #[test]
    fn in_doubt_branch_is_visible() {
        let source = memory_source(ENDPOINT);
        let xid = coordinator_xid(b"crashed", 1);
        leave_in_doubt(&source, &xid, "insert into t values (1)");
        assert_eq!(source.prepared_xids(), vec![xid]);
    }

    #[test]
    fn config_file_round_trips_through_loader() {
        let file = config_file(&serde_json::json!({
            "resourceEndpoint": ENDPOINT,
            "user": USER,
            "password": PASSWORD,
            "maxWaitMillis": 250,
        }));
        let text = std::fs::read_to_string(file.path()).unwrap();
        let config = DataSourceConfig::from_json(&text).unwrap();
        assert_eq!(config.pool_config().max_wait, Duration::from_millis(250));
    }
}
