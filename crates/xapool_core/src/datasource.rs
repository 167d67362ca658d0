//! Transaction-aware data source handing out pooled connections.

use crate::error::{CoreError, CoreResult};
use crate::factory::{PoolableConnectionFactory, XaConnectionFactory};
use crate::pool::{ConnectionPool, PoolStats};
use crate::transaction::{
    PooledConnection, TransactionContext, TransactionManager, TransactionRegistry,
};
use crate::types::{ConnectionId, TransactionId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use xapool_resource::{ResourceError, Xid};

/// The pool type behind a [`ManagedDataSource`].
pub type XaConnectionPool = ConnectionPool<PoolableConnectionFactory>;

/// A pooled data source that enlists its connections in transactions.
///
/// # Connection reuse
///
/// Inside a transaction, each resource gets exactly one branch. When the
/// borrower drops its [`ManagedConnection`] the connection is parked with
/// the transaction; asking again within the same transaction returns that
/// same connection. Parked connections go back to the pool when the
/// transaction completes.
#[derive(Clone)]
pub struct ManagedDataSource {
    tm: Arc<dyn TransactionManager>,
    factory: Arc<XaConnectionFactory>,
    pool: XaConnectionPool,
}

impl ManagedDataSource {
    /// Creates a data source over a pool of XA connections.
    ///
    /// Connections released by completed transactions are returned to
    /// this pool.
    pub fn new(pool: XaConnectionPool) -> Self {
        let factory = Arc::clone(pool.factory().connection_factory());
        let tm = Arc::clone(factory.transaction_manager());

        let weak = pool.downgrade();
        factory
            .transaction_registry()
            .set_recycler(move |conn: PooledConnection| {
                if let Some(pool) = weak.upgrade() {
                    pool.give_back(conn);
                }
            });

        Self { tm, factory, pool }
    }

    /// Hands out a connection.
    ///
    /// Without a transaction the connection comes straight from the pool.
    /// With one, the transaction's parked connection to this resource is
    /// reused if there is one; otherwise a pooled connection is enlisted.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DataSourceUnavailable`] wrapping the pool's error
    ///   (`PoolExhausted`, `ResourceUnavailable`, `PoolClosed`, ...)
    /// - [`CoreError::TransactionNotActive`] if `ctx` is not active
    /// - [`CoreError::ConnectionInUse`] if the transaction's connection to
    ///   this resource is still on loan
    /// - [`CoreError::Enlistment`] if the branch could not be started
    pub fn get_connection(&self, ctx: Option<&TransactionContext>) -> CoreResult<ManagedConnection> {
        let Some(ctx) = ctx else {
            let conn = self.borrow()?;
            return Ok(self.guard(conn, None));
        };

        let txid = ctx.id();
        if !self.tm.is_active(ctx) {
            return Err(CoreError::TransactionNotActive(txid));
        }

        let key = self.factory.resource_key();
        if let Some(conn) = self.factory.transaction_registry().take_parked(txid, key) {
            debug!(transaction = %txid, connection = %conn.connection_id(), "reusing enlisted connection");
            return Ok(self.guard(conn, Some(txid)));
        }

        let mut conn = self.borrow()?;
        if let Err(e) = self.factory.enlist(&mut conn, ctx) {
            self.pool.give_back(conn);
            return Err(e);
        }
        Ok(self.guard(conn, Some(txid)))
    }

    fn borrow(&self) -> CoreResult<PooledConnection> {
        self.pool.borrow().map_err(CoreError::data_source_unavailable)
    }

    fn guard(&self, conn: PooledConnection, transaction: Option<TransactionId>) -> ManagedConnection {
        ManagedConnection {
            id: conn.connection_id(),
            branch: conn.branch().cloned(),
            conn: Some(conn),
            pool: self.pool.clone(),
            registry: Arc::clone(self.factory.transaction_registry()),
            transaction,
        }
    }

    /// Returns the key of the backing resource.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        self.factory.resource_key()
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &XaConnectionPool {
        &self.pool
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Returns the registry of enlisted connections.
    #[must_use]
    pub fn transaction_registry(&self) -> &Arc<TransactionRegistry> {
        self.factory.transaction_registry()
    }

    /// Closes the pool. Connections still on loan are destroyed when
    /// they are released.
    pub fn close(&self) {
        self.pool.close();
    }
}

impl fmt::Debug for ManagedDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDataSource")
            .field("resource", &self.resource_key())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// A connection on loan from a [`ManagedDataSource`].
///
/// Dropping the guard (or calling [`Self::close`]) releases the
/// connection: it is parked with its transaction while that is still
/// running and returned to the pool otherwise. The physical connection
/// stays open.
pub struct ManagedConnection {
    id: ConnectionId,
    branch: Option<Xid>,
    conn: Option<PooledConnection>,
    pool: XaConnectionPool,
    registry: Arc<TransactionRegistry>,
    transaction: Option<TransactionId>,
}

impl ManagedConnection {
    /// Returns the id of the physical connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the transaction the connection is enlisted in.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Returns the XID of the branch the connection carries.
    #[must_use]
    pub fn branch(&self) -> Option<&Xid> {
        self.branch.as_ref()
    }

    /// Executes a statement.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Resource`] if the statement fails.
    pub fn execute(&mut self, statement: &str) -> CoreResult<u64> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(statement),
            None => Err(ResourceError::Closed.into()),
        }
    }

    /// Releases the connection.
    pub fn close(self) {}
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(txid) = self.transaction else {
            self.pool.give_back(conn);
            return;
        };

        let key = conn.resource_key().to_string();
        match self.registry.park(txid, &key, conn) {
            Ok(()) => debug!(transaction = %txid, connection = %self.id, "connection parked"),
            // transaction already completed
            Err(conn) => self.pool.give_back(conn),
        }
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("transaction", &self.transaction)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::transaction::{InMemoryDecisionLog, LocalTransactionManager};
    use std::time::Duration;
    use xapool_resource::{Credentials, InMemoryXaDataSource, ResourceDescriptor};

    struct Fixture {
        source: InMemoryXaDataSource,
        tm: Arc<LocalTransactionManager>,
        ds: ManagedDataSource,
    }

    fn fixture(config: PoolConfig) -> Fixture {
        let source = InMemoryXaDataSource::new(ResourceDescriptor::new(
            "db1",
            Credentials::new("app", "secret"),
        ));
        let tm = Arc::new(LocalTransactionManager::new(Arc::new(
            InMemoryDecisionLog::new(),
        )));
        let xa = Arc::new(XaConnectionFactory::new(tm.clone(), Arc::new(source.clone())));
        let pool = ConnectionPool::new(PoolableConnectionFactory::new(xa, None), config).unwrap();
        Fixture {
            source,
            tm,
            ds: ManagedDataSource::new(pool),
        }
    }

    #[test]
    fn connection_without_transaction_returns_to_pool() {
        let f = fixture(PoolConfig::new());
        let mut conn = f.ds.get_connection(None).unwrap();
        assert!(conn.transaction().is_none());
        conn.execute("insert into t values (1)").unwrap();
        assert_eq!(f.ds.stats().active, 1);

        conn.close();
        let stats = f.ds.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        // auto-commit outside a transaction
        assert_eq!(f.source.committed_statements(), vec!["insert into t values (1)"]);
    }

    #[test]
    fn same_transaction_reuses_the_parked_connection() {
        let f = fixture(PoolConfig::new());
        let txn = f.tm.begin();

        let mut first = f.ds.get_connection(Some(&txn)).unwrap();
        first.execute("insert into t values (1)").unwrap();
        let id = first.id();
        let xid = first.branch().cloned().unwrap();
        drop(first);
        assert_eq!(f.ds.stats().idle, 0, "parked, not idle");

        let mut second = f.ds.get_connection(Some(&txn)).unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.branch(), Some(&xid));
        second.execute("insert into t values (2)").unwrap();
        drop(second);

        assert_eq!(f.tm.branch_count(&txn), 1);
        f.tm.commit(&txn).unwrap();

        assert_eq!(
            f.source.committed_statements(),
            vec!["insert into t values (1)", "insert into t values (2)"]
        );
        let stats = f.ds.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert!(f.ds.transaction_registry().active_transactions().is_empty());
    }

    #[test]
    fn rollback_returns_parked_connections() {
        let f = fixture(PoolConfig::new());
        let txn = f.tm.begin();
        let mut conn = f.ds.get_connection(Some(&txn)).unwrap();
        conn.execute("insert into t values (1)").unwrap();
        drop(conn);

        f.tm.rollback(&txn).unwrap();
        assert!(f.source.committed_statements().is_empty());
        assert_eq!(f.ds.stats().idle, 1);

        // the recycled connection is clean and usable outside the transaction
        let conn = f.ds.get_connection(None).unwrap();
        assert!(conn.transaction().is_none());
        assert!(conn.branch().is_none());
    }

    #[test]
    fn concurrent_request_in_same_transaction_is_refused() {
        let f = fixture(PoolConfig::new());
        let txn = f.tm.begin();
        let _held = f.ds.get_connection(Some(&txn)).unwrap();

        let err = f.ds.get_connection(Some(&txn)).unwrap_err();
        assert!(matches!(err, CoreError::ConnectionInUse { .. }));
        // the extra connection went back to the pool
        assert_eq!(f.ds.stats().active, 1);
    }

    #[test]
    fn guard_still_on_loan_at_commit_goes_back_to_pool() {
        let f = fixture(PoolConfig::new());
        let txn = f.tm.begin();
        let mut conn = f.ds.get_connection(Some(&txn)).unwrap();
        conn.execute("insert into t values (1)").unwrap();

        f.tm.commit(&txn).unwrap();
        drop(conn);
        assert_eq!(f.ds.stats().idle, 1);
        assert_eq!(f.source.committed_statements(), vec!["insert into t values (1)"]);
    }

    #[test]
    fn inactive_transaction_is_rejected() {
        let f = fixture(PoolConfig::new());
        let txn = f.tm.begin();
        f.tm.commit(&txn).unwrap();
        assert!(matches!(
            f.ds.get_connection(Some(&txn)),
            Err(CoreError::TransactionNotActive(_))
        ));
    }

    #[test]
    fn pool_failures_surface_as_data_source_unavailable() {
        let f = fixture(PoolConfig::new().max_total(1).max_wait(Duration::from_millis(20)));
        let _held = f.ds.get_connection(None).unwrap();
        let err = f.ds.get_connection(None).unwrap_err();
        assert!(matches!(err, CoreError::DataSourceUnavailable(_)));
        assert!(err.is_pool_exhausted());

        f.ds.close();
        let err = f.ds.get_connection(None).unwrap_err();
        assert!(matches!(err.root(), CoreError::PoolClosed));
    }

    #[test]
    fn unreachable_resource_surfaces_as_data_source_unavailable() {
        let f = fixture(PoolConfig::new());
        f.source.set_reachable(false);
        let err = f.ds.get_connection(None).unwrap_err();
        assert!(matches!(err, CoreError::DataSourceUnavailable(_)));
        assert!(err.is_resource_unavailable());
    }
}
