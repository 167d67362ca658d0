//! In-process transaction manager.

use crate::error::{CoreError, CoreResult};
use crate::transaction::context::{
    Synchronization, TransactionContext, TransactionManager, TransactionStatus, FORMAT_ID,
};
use crate::transaction::decision::{DecisionLog, Outcome};
use crate::types::TransactionId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use xapool_resource::{Vote, XaErrorCode, XaResource, Xid};

struct Branch {
    xid: Xid,
    resource: Arc<dyn XaResource>,
}

struct TxnState {
    ctx: TransactionContext,
    status: TransactionStatus,
    branches: Vec<Branch>,
    syncs: Vec<Box<dyn Synchronization>>,
    next_branch: u32,
}

/// A presumed-abort transaction manager running inside the process.
///
/// Commits a single branch in one phase and several branches in two
/// phases. The commit decision is written to the [`DecisionLog`] after
/// every branch prepared and before the first branch commits, and is
/// forgotten once all branches committed.
///
/// The manager is itself a [`DecisionLog`]: transactions it is still
/// preparing or committing report [`Outcome::InFlight`], so a recovery
/// scan running concurrently leaves their branches alone.
pub struct LocalTransactionManager {
    log: Arc<dyn DecisionLog>,
    next_txid: AtomicU64,
    active: RwLock<HashMap<TransactionId, Arc<Mutex<TxnState>>>>,
    in_flight: RwLock<HashSet<Vec<u8>>>,
}

impl LocalTransactionManager {
    /// Creates a manager recording decisions in `log`.
    pub fn new(log: Arc<dyn DecisionLog>) -> Self {
        Self {
            log,
            next_txid: AtomicU64::new(1),
            active: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashSet::new()),
        }
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> TransactionContext {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let ctx = TransactionContext::new(id, Uuid::new_v4().into_bytes());
        let state = TxnState {
            ctx: ctx.clone(),
            status: TransactionStatus::Active,
            branches: Vec::new(),
            syncs: Vec::new(),
            next_branch: 1,
        };
        self.active.write().insert(id, Arc::new(Mutex::new(state)));
        debug!(transaction = %id, "transaction started");
        ctx
    }

    /// Returns the number of transactions that have not completed.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Returns the number of branches enlisted in a transaction.
    #[must_use]
    pub fn branch_count(&self, ctx: &TransactionContext) -> usize {
        self.state(ctx.id())
            .map_or(0, |state| state.lock().branches.len())
    }

    /// Commits a transaction.
    ///
    /// Returns the final status, which is always
    /// [`TransactionStatus::Committed`] on success.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotActive`] if the transaction is
    /// unknown or already completing, and [`CoreError::TransactionRolledBack`]
    /// if it was marked rollback-only or a branch failed to prepare. In the
    /// latter case every branch has been rolled back.
    pub fn commit(&self, ctx: &TransactionContext) -> CoreResult<TransactionStatus> {
        let id = ctx.id();
        let state = self.state(id).ok_or(CoreError::TransactionNotActive(id))?;

        let (result, syncs) = {
            let mut state = state.lock();
            let result = match state.status {
                TransactionStatus::Active => self.complete_commit(&mut state),
                TransactionStatus::MarkedRollback => {
                    Self::rollback_branches(&mut state);
                    Err(CoreError::TransactionRolledBack {
                        id,
                        reason: "transaction was marked rollback-only".into(),
                    })
                }
                _ => return Err(CoreError::TransactionNotActive(id)),
            };
            (result, std::mem::take(&mut state.syncs))
        };

        self.finish(id, syncs, &result);
        result
    }

    /// Rolls back a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotActive`] if the transaction is
    /// unknown or already completing.
    pub fn rollback(&self, ctx: &TransactionContext) -> CoreResult<()> {
        let id = ctx.id();
        let state = self.state(id).ok_or(CoreError::TransactionNotActive(id))?;

        let syncs = {
            let mut state = state.lock();
            if !state.status.is_active() {
                return Err(CoreError::TransactionNotActive(id));
            }
            Self::rollback_branches(&mut state);
            std::mem::take(&mut state.syncs)
        };

        self.finish(id, syncs, &Ok(TransactionStatus::RolledBack));
        Ok(())
    }

    fn state(&self, id: TransactionId) -> Option<Arc<Mutex<TxnState>>> {
        self.active.read().get(&id).cloned()
    }

    fn complete_commit(&self, state: &mut TxnState) -> CoreResult<TransactionStatus> {
        let id = state.ctx.id();

        let end_failure = state.branches.iter().find_map(|branch| {
            branch
                .resource
                .end(&branch.xid, true)
                .err()
                .map(|e| format!("failed to end branch {}: {e}", branch.xid))
        });
        if let Some(reason) = end_failure {
            Self::rollback_branches(state);
            return Err(CoreError::TransactionRolledBack { id, reason });
        }

        match state.branches.len() {
            0 => {}
            1 => {
                let branch = &state.branches[0];
                if let Err(e) = branch.resource.commit(&branch.xid, true) {
                    state.status = TransactionStatus::RolledBack;
                    return Err(CoreError::TransactionRolledBack {
                        id,
                        reason: format!("one-phase commit of {} failed: {e}", branch.xid),
                    });
                }
            }
            _ => self.two_phase_commit(state)?,
        }

        state.status = TransactionStatus::Committed;
        debug!(transaction = %id, branches = state.branches.len(), "transaction committed");
        Ok(TransactionStatus::Committed)
    }

    fn two_phase_commit(&self, state: &mut TxnState) -> CoreResult<()> {
        let id = state.ctx.id();
        let gtrid = state.ctx.gtrid().to_vec();

        state.status = TransactionStatus::Preparing;
        self.in_flight.write().insert(gtrid.clone());

        let mut prepared = Vec::with_capacity(state.branches.len());
        let mut prepare_failure = None;
        for (index, branch) in state.branches.iter().enumerate() {
            match branch.resource.prepare(&branch.xid) {
                Ok(Vote::Commit) => prepared.push(index),
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    prepare_failure = Some(format!("branch {} failed to prepare: {e}", branch.xid));
                    break;
                }
            }
        }
        if let Some(reason) = prepare_failure {
            Self::rollback_branches(state);
            self.in_flight.write().remove(&gtrid);
            return Err(CoreError::TransactionRolledBack { id, reason });
        }

        state.status = TransactionStatus::Committing;
        self.log.record_commit(&gtrid);

        let mut failures = 0;
        for index in prepared {
            let branch = &state.branches[index];
            if let Err(e) = branch.resource.commit(&branch.xid, false) {
                // The decision stays logged; recovery finishes the branch.
                warn!(transaction = %id, xid = %branch.xid, error = %e, "branch commit failed");
                failures += 1;
            }
        }
        if failures == 0 {
            self.log.forget(&gtrid);
        }
        self.in_flight.write().remove(&gtrid);
        Ok(())
    }

    fn rollback_branches(state: &mut TxnState) {
        let id = state.ctx.id();
        for branch in &state.branches {
            // Fails for branches that already ended; that is fine.
            let _ = branch.resource.end(&branch.xid, false);
            match branch.resource.rollback(&branch.xid) {
                Ok(()) => {}
                // prepare failures and read-only votes already removed it
                Err(e) if e.xa_code() == Some(XaErrorCode::UnknownXid) => {}
                Err(e) => {
                    warn!(transaction = %id, xid = %branch.xid, error = %e, "branch rollback failed");
                }
            }
        }
        state.status = TransactionStatus::RolledBack;
        debug!(transaction = %id, "transaction rolled back");
    }

    fn finish(
        &self,
        id: TransactionId,
        syncs: Vec<Box<dyn Synchronization>>,
        result: &CoreResult<TransactionStatus>,
    ) {
        self.active.write().remove(&id);
        let status = match result {
            Ok(status) => *status,
            Err(_) => TransactionStatus::RolledBack,
        };
        for sync in syncs {
            sync.after_completion(status);
        }
    }
}

impl TransactionManager for LocalTransactionManager {
    fn status(&self, ctx: &TransactionContext) -> TransactionStatus {
        self.state(ctx.id())
            .map_or(TransactionStatus::NoTransaction, |state| state.lock().status)
    }

    fn enlist(&self, ctx: &TransactionContext, resource: Arc<dyn XaResource>) -> CoreResult<Xid> {
        let id = ctx.id();
        let state = self.state(id).ok_or(CoreError::TransactionNotActive(id))?;
        let mut state = state.lock();
        if !state.status.is_active() {
            return Err(CoreError::TransactionNotActive(id));
        }
        // one branch per resource, however many pools front it
        let key = resource.resource_key();
        if state
            .branches
            .iter()
            .any(|branch| branch.resource.resource_key() == key)
        {
            return Err(CoreError::ConnectionInUse {
                transaction: id,
                resource: key.to_string(),
            });
        }

        let bqual = state.next_branch.to_be_bytes();
        let xid = Xid::new(FORMAT_ID, ctx.gtrid(), &bqual)?;
        resource
            .start(&xid)
            .map_err(|source| CoreError::Enlistment {
                resource: resource.resource_key().to_string(),
                source,
            })?;

        state.next_branch += 1;
        debug!(transaction = %id, xid = %xid, resource = resource.resource_key(), "branch enlisted");
        state.branches.push(Branch { xid: xid.clone(), resource });
        Ok(xid)
    }

    fn register_synchronization(
        &self,
        ctx: &TransactionContext,
        sync: Box<dyn Synchronization>,
    ) -> CoreResult<()> {
        let id = ctx.id();
        let state = self.state(id).ok_or(CoreError::TransactionNotActive(id))?;
        let mut state = state.lock();
        if !state.status.is_active() {
            return Err(CoreError::TransactionNotActive(id));
        }
        state.syncs.push(sync);
        Ok(())
    }

    fn set_rollback_only(&self, ctx: &TransactionContext) -> CoreResult<()> {
        let id = ctx.id();
        let state = self.state(id).ok_or(CoreError::TransactionNotActive(id))?;
        let mut state = state.lock();
        if !state.status.is_active() {
            return Err(CoreError::TransactionNotActive(id));
        }
        state.status = TransactionStatus::MarkedRollback;
        Ok(())
    }
}

impl DecisionLog for LocalTransactionManager {
    fn record_commit(&self, gtrid: &[u8]) {
        self.log.record_commit(gtrid);
    }

    fn forget(&self, gtrid: &[u8]) {
        self.log.forget(gtrid);
    }

    fn outcome(&self, gtrid: &[u8]) -> Outcome {
        if self.in_flight.read().contains(gtrid) {
            Outcome::InFlight
        } else {
            self.log.outcome(gtrid)
        }
    }
}

impl std::fmt::Debug for LocalTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransactionManager")
            .field("active", &self.active.read().len())
            .field("in_flight", &self.in_flight.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::decision::InMemoryDecisionLog;
    use xapool_resource::{
        Credentials, InMemoryXaDataSource, ResourceDescriptor, XaConnection, XaDataSource,
    };

    fn source(endpoint: &str) -> InMemoryXaDataSource {
        InMemoryXaDataSource::new(ResourceDescriptor::new(
            endpoint,
            Credentials::new("app", "secret"),
        ))
    }

    fn connect(source: &InMemoryXaDataSource) -> Box<dyn XaConnection> {
        source
            .connect(&Credentials::new("app", "secret"))
            .ok()
            .unwrap()
    }

    fn manager() -> (Arc<InMemoryDecisionLog>, LocalTransactionManager) {
        let log = Arc::new(InMemoryDecisionLog::new());
        let tm = LocalTransactionManager::new(log.clone());
        (log, tm)
    }

    #[test]
    fn begin_assigns_unique_ids() {
        let (_, tm) = manager();
        let t1 = tm.begin();
        let t2 = tm.begin();
        assert_ne!(t1.id(), t2.id());
        assert_ne!(t1.gtrid(), t2.gtrid());
        assert_eq!(tm.status(&t1), TransactionStatus::Active);
        assert_eq!(tm.active_count(), 2);
    }

    #[test]
    fn single_branch_commits_in_one_phase() {
        let (log, tm) = manager();
        let db = source("db1");
        let mut conn = connect(&db);

        let txn = tm.begin();
        let xid = tm.enlist(&txn, conn.xa_resource()).unwrap();
        assert_eq!(xid.format_id(), FORMAT_ID);
        conn.execute("insert into t values (1)").unwrap();

        assert_eq!(tm.commit(&txn).unwrap(), TransactionStatus::Committed);
        assert_eq!(db.committed_statements(), vec!["insert into t values (1)"]);
        assert_eq!(tm.status(&txn), TransactionStatus::NoTransaction);
        assert!(log.is_empty());
    }

    #[test]
    fn two_branches_commit_in_two_phases() {
        let (log, tm) = manager();
        let db1 = source("db1");
        let db2 = source("db2");
        let mut c1 = connect(&db1);
        let mut c2 = connect(&db2);

        let txn = tm.begin();
        let x1 = tm.enlist(&txn, c1.xa_resource()).unwrap();
        let x2 = tm.enlist(&txn, c2.xa_resource()).unwrap();
        assert!(x1.same_transaction(&x2));
        assert_ne!(x1.bqual(), x2.bqual());
        assert_eq!(tm.branch_count(&txn), 2);

        c1.execute("insert into a values (1)").unwrap();
        c2.execute("insert into b values (2)").unwrap();
        tm.commit(&txn).unwrap();

        assert_eq!(db1.committed_statements(), vec!["insert into a values (1)"]);
        assert_eq!(db2.committed_statements(), vec!["insert into b values (2)"]);
        assert!(log.is_empty());
    }

    /// Delegates to a real branch but refuses to prepare.
    struct RefusesPrepare(Arc<dyn XaResource>);

    impl XaResource for RefusesPrepare {
        fn resource_key(&self) -> &str {
            self.0.resource_key()
        }
        fn start(&self, xid: &Xid) -> xapool_resource::ResourceResult<()> {
            self.0.start(xid)
        }
        fn end(&self, xid: &Xid, success: bool) -> xapool_resource::ResourceResult<()> {
            self.0.end(xid, success)
        }
        fn prepare(&self, _xid: &Xid) -> xapool_resource::ResourceResult<Vote> {
            Err(xapool_resource::ResourceError::xa(
                XaErrorCode::ResourceManagerFailed,
                "disk full",
            ))
        }
        fn commit(&self, xid: &Xid, one_phase: bool) -> xapool_resource::ResourceResult<()> {
            self.0.commit(xid, one_phase)
        }
        fn rollback(&self, xid: &Xid) -> xapool_resource::ResourceResult<()> {
            self.0.rollback(xid)
        }
        fn recover(&self) -> xapool_resource::ResourceResult<Vec<Xid>> {
            self.0.recover()
        }
    }

    #[test]
    fn failed_prepare_rolls_back_everything() {
        let (log, tm) = manager();
        let db1 = source("db1");
        let db2 = source("db2");
        let mut c1 = connect(&db1);
        let mut c2 = connect(&db2);

        let txn = tm.begin();
        tm.enlist(&txn, c1.xa_resource()).unwrap();
        tm.enlist(&txn, Arc::new(RefusesPrepare(c2.xa_resource())))
            .unwrap();
        c1.execute("insert into a values (1)").unwrap();
        c2.execute("insert into b values (2)").unwrap();

        let err = tm.commit(&txn).unwrap_err();
        assert!(matches!(err, CoreError::TransactionRolledBack { .. }));
        assert!(db1.committed_statements().is_empty());
        assert!(db2.committed_statements().is_empty());
        assert_eq!(db1.branch_count() + db2.branch_count(), 0);
        assert!(log.is_empty());
        assert_eq!(tm.outcome(txn.gtrid()), Outcome::Unknown);
    }

    #[test]
    fn rollback_only_transaction_cannot_commit() {
        let (_, tm) = manager();
        let db = source("db1");
        let mut conn = connect(&db);

        let txn = tm.begin();
        tm.enlist(&txn, conn.xa_resource()).unwrap();
        conn.execute("insert into t values (1)").unwrap();
        tm.set_rollback_only(&txn).unwrap();
        assert!(tm.is_active(&txn));

        assert!(tm.commit(&txn).is_err());
        assert!(db.committed_statements().is_empty());
        assert_eq!(db.rollback_count(), 1);
    }

    #[test]
    fn rollback_discards_work_and_runs_synchronizations() {
        let (_, tm) = manager();
        let db = source("db1");
        let mut conn = connect(&db);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let txn = tm.begin();
        tm.enlist(&txn, conn.xa_resource()).unwrap();
        let sink = Arc::clone(&seen);
        tm.register_synchronization(
            &txn,
            Box::new(move |status: TransactionStatus| sink.lock().push(status)),
        )
        .unwrap();
        conn.execute("insert into t values (1)").unwrap();

        tm.rollback(&txn).unwrap();
        assert!(db.committed_statements().is_empty());
        assert_eq!(*seen.lock(), vec![TransactionStatus::RolledBack]);
        assert!(tm.rollback(&txn).is_err());
    }

    #[test]
    fn completed_transaction_rejects_enlistment() {
        let (_, tm) = manager();
        let db = source("db1");
        let conn = connect(&db);

        let txn = tm.begin();
        tm.commit(&txn).unwrap();
        assert!(matches!(
            tm.enlist(&txn, conn.xa_resource()),
            Err(CoreError::TransactionNotActive(_))
        ));
    }

    #[test]
    fn duplicate_start_is_an_enlistment_error() {
        let (_, tm) = manager();
        let db = source("db1");
        let conn = connect(&db);

        let t1 = tm.begin();
        let t2 = tm.begin();
        tm.enlist(&t1, conn.xa_resource()).unwrap();
        let err = tm.enlist(&t2, conn.xa_resource()).unwrap_err();
        assert!(matches!(err, CoreError::Enlistment { ref resource, .. } if resource == "db1"));
    }

    #[test]
    fn second_branch_on_the_same_resource_is_refused() {
        let (_, tm) = manager();
        let db = source("db1");
        let c1 = connect(&db);
        let c2 = connect(&db);

        let txn = tm.begin();
        tm.enlist(&txn, c1.xa_resource()).unwrap();
        let err = tm.enlist(&txn, c2.xa_resource()).unwrap_err();
        assert!(matches!(err, CoreError::ConnectionInUse { ref resource, .. } if resource == "db1"));
        assert_eq!(tm.branch_count(&txn), 1);
        assert_eq!(db.branch_count(), 1);

        // another transaction still gets its own branch
        let other = tm.begin();
        assert!(tm.enlist(&other, c2.xa_resource()).is_ok());
    }

    #[test]
    fn decisions_are_reported_through_the_manager() {
        let (log, tm) = manager();
        assert_eq!(tm.outcome(b"g"), Outcome::Unknown);
        log.record_commit(b"g");
        assert_eq!(tm.outcome(b"g"), Outcome::Committed);
        tm.in_flight.write().insert(b"g".to_vec());
        assert_eq!(tm.outcome(b"g"), Outcome::InFlight);
    }
}
