//! # xapool Core
//!
//! Transaction-aware connection pooling for XA resources.
//!
//! This crate provides:
//! - An XA connection factory that enlists connections in transactions
//! - A bounded, blocking object pool with lifecycle hooks and idle eviction
//! - A managed data source handing out scoped connection guards
//! - A transaction registry tracking enlistments per transaction
//! - A recovery manager that resolves in-doubt branches after a crash
//! - A wrapper that wires all of the above for one XA data source
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use xapool_core::{
//!     DataSourceConfig, InMemoryDecisionLog, LocalTransactionManager, RecoveryManager,
//!     XaDataSourceWrapper, XaPoolWrapper,
//! };
//! use xapool_resource::{Credentials, InMemoryXaDataSource, ResourceDescriptor};
//!
//! let log = Arc::new(InMemoryDecisionLog::new());
//! let tm = Arc::new(LocalTransactionManager::new(log));
//! let recovery = Arc::new(RecoveryManager::new(tm.clone()));
//! let config = DataSourceConfig::new("db1", "app", "secret").max_total(2);
//!
//! let wrapper = XaPoolWrapper::new(tm.clone(), recovery, config).unwrap();
//! let source = InMemoryXaDataSource::new(ResourceDescriptor::new(
//!     "db1",
//!     Credentials::new("app", "secret"),
//! ));
//! let ds = wrapper.wrap_data_source(Arc::new(source.clone())).unwrap();
//!
//! let txn = tm.begin();
//! let mut conn = ds.get_connection(Some(&txn)).unwrap();
//! conn.execute("insert into t values (1)").unwrap();
//! drop(conn);
//! tm.commit(&txn).unwrap();
//! assert_eq!(source.committed_statements(), vec!["insert into t values (1)"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod datasource;
pub mod error;
pub mod factory;
pub mod pool;
pub mod recovery;
pub mod transaction;
pub mod types;
pub mod wrapper;

mod worker;

pub use config::{DataSourceConfig, IdleOrder, PoolConfig};
pub use datasource::{ManagedConnection, ManagedDataSource, XaConnectionPool};
pub use error::{CoreError, CoreResult};
pub use factory::{PoolableConnectionFactory, XaConnectionFactory, XaPooledConnection};
pub use pool::{
    ConnectionPool, EvictionReport, PoolStats, PooledObject, PooledObjectFactory, WeakConnectionPool,
};
pub use recovery::{
    DataSourceRecoveryHelper, RecoveryHelper, RecoveryManager, RecoveryReport, RecoveryScan,
    RecoveryState, Registration,
};
pub use transaction::{
    Claim, DecisionLog, Enlistment, InMemoryDecisionLog, LocalTransactionManager, Outcome,
    PooledConnection, Synchronization, TransactionContext, TransactionManager, TransactionRegistry,
    TransactionStatus, FORMAT_ID,
};
pub use types::{ConnectionId, TransactionId};
pub use wrapper::{XaDataSourceWrapper, XaPoolWrapper};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
