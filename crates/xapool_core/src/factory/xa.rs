//! XA connection factory.

use crate::error::{CoreError, CoreResult};
use crate::transaction::{
    Claim, TransactionContext, TransactionManager, TransactionRegistry, TransactionStatus,
};
use crate::types::{ConnectionId, TransactionId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use xapool_resource::{ResourceDescriptor, XaConnection, XaDataSource, XaResource, Xid};

/// A physical XA connection plus the branch it currently carries.
pub struct XaPooledConnection {
    id: ConnectionId,
    inner: Box<dyn XaConnection>,
    xa: Arc<dyn XaResource>,
    branch: Option<(TransactionId, Xid)>,
}

impl XaPooledConnection {
    /// Wraps a physical connection.
    pub fn new(id: ConnectionId, inner: Box<dyn XaConnection>) -> Self {
        let xa = inner.xa_resource();
        Self {
            id,
            inner,
            xa,
            branch: None,
        }
    }

    /// Returns the factory-assigned connection id.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the key of the resource this connection belongs to.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        self.xa.resource_key()
    }

    /// Returns the XA branch handle of the connection.
    #[must_use]
    pub fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.xa)
    }

    /// Executes a statement, inside the current branch if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Resource`] if the statement fails.
    pub fn execute(&mut self, statement: &str) -> CoreResult<u64> {
        Ok(self.inner.execute(statement)?)
    }

    /// Returns the transaction this connection is enlisted in.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.branch.as_ref().map(|(txid, _)| *txid)
    }

    /// Returns the XID of the branch this connection carries.
    #[must_use]
    pub fn branch(&self) -> Option<&Xid> {
        self.branch.as_ref().map(|(_, xid)| xid)
    }

    /// Returns the underlying physical connection.
    pub fn connection_mut(&mut self) -> &mut dyn XaConnection {
        self.inner.as_mut()
    }

    /// Returns true if the physical connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub(crate) fn bind(&mut self, txid: TransactionId, xid: Xid) {
        self.branch = Some((txid, xid));
    }

    pub(crate) fn unbind(&mut self) -> Option<(TransactionId, Xid)> {
        self.branch.take()
    }
}

impl fmt::Debug for XaPooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaPooledConnection")
            .field("id", &self.id)
            .field("resource", &self.resource_key())
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

/// Opens physical connections and enlists them in transactions.
///
/// Each factory owns the [`TransactionRegistry`] of its resource. Every
/// enlistment goes through it, so a transaction gets at most one branch on
/// the resource no matter how many connections it asks for.
pub struct XaConnectionFactory {
    tm: Arc<dyn TransactionManager>,
    source: Arc<dyn XaDataSource>,
    registry: Arc<TransactionRegistry>,
    next_id: AtomicU64,
}

impl XaConnectionFactory {
    /// Creates a factory for a data source.
    pub fn new(tm: Arc<dyn TransactionManager>, source: Arc<dyn XaDataSource>) -> Self {
        Self {
            tm,
            source,
            registry: Arc::new(TransactionRegistry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the registry of enlisted connections.
    #[must_use]
    pub fn transaction_registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// Returns the transaction manager connections are enlisted with.
    #[must_use]
    pub fn transaction_manager(&self) -> &Arc<dyn TransactionManager> {
        &self.tm
    }

    /// Returns the descriptor of the backing resource.
    #[must_use]
    pub fn descriptor(&self) -> &ResourceDescriptor {
        self.source.descriptor()
    }

    /// Returns the resource key, i.e. the endpoint.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        self.source.descriptor().endpoint()
    }

    /// Opens a connection with the primary credentials.
    ///
    /// If `ctx` is an active transaction the connection is enlisted before
    /// it is returned.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ResourceUnavailable`] if the resource cannot be reached
    /// - [`CoreError::Resource`] if it rejects the credentials
    /// - the errors of [`Self::enlist`]
    pub fn create_connection(
        &self,
        ctx: Option<&TransactionContext>,
    ) -> CoreResult<XaPooledConnection> {
        let descriptor = self.source.descriptor();
        let inner = self
            .source
            .connect(descriptor.credentials())
            .map_err(|e| CoreError::from_connect(descriptor.endpoint(), e))?;

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut conn = XaPooledConnection::new(id, inner);
        debug!(connection = %id, resource = descriptor.endpoint(), "physical connection opened");

        if let Some(ctx) = ctx.filter(|ctx| self.tm.is_active(ctx)) {
            self.enlist(&mut conn, ctx)?;
        }
        Ok(conn)
    }

    /// Enlists a connection in a transaction.
    ///
    /// Idempotent for a connection already carrying the transaction's
    /// branch. On the transaction's first enlistment a completion callback
    /// is registered that releases the transaction's parked connections.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionNotActive`] if the transaction is over
    /// - [`CoreError::ConnectionInUse`] if another connection already
    ///   carries the transaction's branch on this resource
    /// - [`CoreError::Enlistment`] if the resource refused the branch
    pub fn enlist(&self, conn: &mut XaPooledConnection, ctx: &TransactionContext) -> CoreResult<Xid> {
        let txid = ctx.id();
        if let Some((bound, xid)) = conn.branch.as_ref() {
            if *bound == txid {
                return Ok(xid.clone());
            }
        }
        if !self.tm.is_active(ctx) {
            return Err(CoreError::TransactionNotActive(txid));
        }

        let key = self.resource_key();
        match self.registry.claim(txid, key)? {
            Claim::Parked(other) => {
                if let Err(other) = self.registry.park(txid, key, other) {
                    self.registry.recycle(other);
                }
                Err(CoreError::ConnectionInUse {
                    transaction: txid,
                    resource: key.to_string(),
                })
            }
            Claim::Fresh {
                needs_synchronization,
            } => {
                let result = self.start_branch(conn, ctx, needs_synchronization);
                if result.is_err() {
                    self.registry.release_claim(txid, key);
                }
                result
            }
        }
    }

    fn start_branch(
        &self,
        conn: &mut XaPooledConnection,
        ctx: &TransactionContext,
        needs_synchronization: bool,
    ) -> CoreResult<Xid> {
        let txid = ctx.id();
        if needs_synchronization {
            let registry = Arc::clone(&self.registry);
            let registered = self.tm.register_synchronization(
                ctx,
                Box::new(move |status: TransactionStatus| {
                    debug!(transaction = %txid, ?status, "transaction completed");
                    registry.release(txid);
                }),
            );
            if let Err(e) = registered {
                self.registry.release(txid);
                return Err(e);
            }
        }

        let xid = self.tm.enlist(ctx, conn.xa_resource()).inspect_err(|e| {
            warn!(transaction = %txid, connection = %conn.id, error = %e, "enlistment failed");
        })?;
        conn.bind(txid, xid.clone());
        self.registry
            .record(txid, self.resource_key(), xid.clone(), conn.connection_id());
        Ok(xid)
    }
}

impl fmt::Debug for XaConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XaConnectionFactory")
            .field("resource", &self.resource_key())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{InMemoryDecisionLog, LocalTransactionManager};
    use xapool_resource::{Credentials, InMemoryXaDataSource};

    fn setup() -> (
        InMemoryXaDataSource,
        Arc<LocalTransactionManager>,
        XaConnectionFactory,
    ) {
        let source = InMemoryXaDataSource::new(ResourceDescriptor::new(
            "db1",
            Credentials::new("app", "secret"),
        ));
        let tm = Arc::new(LocalTransactionManager::new(Arc::new(
            InMemoryDecisionLog::new(),
        )));
        let factory = XaConnectionFactory::new(tm.clone(), Arc::new(source.clone()));
        (source, tm, factory)
    }

    #[test]
    fn creates_connections_with_primary_credentials() {
        let (source, _, factory) = setup();
        let c1 = factory.create_connection(None).unwrap();
        let c2 = factory.create_connection(None).unwrap();
        assert_ne!(c1.connection_id(), c2.connection_id());
        assert!(c1.transaction().is_none());
        assert_eq!(c1.resource_key(), "db1");
        assert_eq!(source.logins(), vec!["app", "app"]);
    }

    #[test]
    fn unreachable_resource_is_unavailable() {
        let (source, _, factory) = setup();
        source.set_reachable(false);
        let err = factory.create_connection(None).unwrap_err();
        assert!(err.is_resource_unavailable());
        assert!(err.is_retryable());
    }

    #[test]
    fn creating_inside_a_transaction_enlists() {
        let (source, tm, factory) = setup();
        let txn = tm.begin();

        let mut conn = factory.create_connection(Some(&txn)).unwrap();
        assert_eq!(conn.transaction(), Some(txn.id()));
        assert!(factory.transaction_registry().is_enlisted(txn.id(), "db1"));

        conn.execute("insert into t values (1)").unwrap();
        tm.commit(&txn).unwrap();
        assert_eq!(source.committed_statements(), vec!["insert into t values (1)"]);
        assert!(factory.transaction_registry().active_transactions().is_empty());
    }

    #[test]
    fn enlist_is_idempotent_per_connection() {
        let (_, tm, factory) = setup();
        let txn = tm.begin();
        let mut conn = factory.create_connection(None).unwrap();

        let x1 = factory.enlist(&mut conn, &txn).unwrap();
        let x2 = factory.enlist(&mut conn, &txn).unwrap();
        assert_eq!(x1, x2);
        assert_eq!(tm.branch_count(&txn), 1);
        assert_eq!(factory.transaction_registry().enlisted_count(txn.id()), 1);
    }

    #[test]
    fn second_connection_in_same_transaction_is_refused() {
        let (_, tm, factory) = setup();
        let txn = tm.begin();
        let _first = factory.create_connection(Some(&txn)).unwrap();

        let mut second = factory.create_connection(None).unwrap();
        let err = factory.enlist(&mut second, &txn).unwrap_err();
        assert!(matches!(err, CoreError::ConnectionInUse { .. }));
        assert_eq!(tm.branch_count(&txn), 1);
    }

    #[test]
    fn inactive_transaction_is_not_enlisted() {
        let (_, tm, factory) = setup();
        let txn = tm.begin();
        tm.rollback(&txn).unwrap();

        let conn = factory.create_connection(Some(&txn)).unwrap();
        assert!(conn.transaction().is_none());

        let mut conn = conn;
        assert!(matches!(
            factory.enlist(&mut conn, &txn),
            Err(CoreError::TransactionNotActive(_))
        ));
    }

    #[test]
    fn failed_enlistment_frees_the_claim() {
        let (_, tm, factory) = setup();
        let t1 = tm.begin();
        let t2 = tm.begin();
        let mut conn = factory.create_connection(Some(&t1)).unwrap();

        // the connection is still associated with t1's branch
        assert!(matches!(
            factory.enlist(&mut conn, &t2),
            Err(CoreError::Enlistment { .. })
        ));
        assert!(!factory.transaction_registry().is_enlisted(t2.id(), "db1"));

        let mut other = factory.create_connection(None).unwrap();
        assert!(factory.enlist(&mut other, &t2).is_ok());
    }
}
