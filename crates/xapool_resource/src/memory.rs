//! In-memory XA resource for testing and simulation.

use crate::credentials::{Credentials, ResourceDescriptor};
use crate::error::{ResourceError, ResourceResult, XaErrorCode};
use crate::source::{Vote, XaConnection, XaDataSource, XaResource};
use crate::xid::Xid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchState {
    Active,
    Ended,
    Prepared,
}

#[derive(Debug)]
struct Branch {
    state: BranchState,
    rollback_only: bool,
    statements: Vec<String>,
}

#[derive(Debug)]
struct ResourceState {
    reachable: bool,
    fail_close: bool,
    accounts: Vec<Credentials>,
    logins: Vec<String>,
    next_connection: u64,
    opened: u64,
    open: HashSet<u64>,
    broken: HashSet<u64>,
    branches: HashMap<Xid, Branch>,
    committed: Vec<String>,
    commits: u64,
    rollbacks: u64,
}

#[derive(Debug)]
struct Shared {
    endpoint: String,
    state: Mutex<ResourceState>,
}

/// An in-memory XA resource manager.
///
/// This data source keeps all resource manager state in memory and is
/// suitable for:
/// - Unit and integration tests of the pool and recovery paths
/// - Simulations run from the command line
///
/// Clones share the same resource manager, so a clone kept by a test can
/// observe and disturb what the pool is doing.
///
/// # Fault Injection
///
/// - [`Self::set_reachable`] makes new connections and recovery scans fail
/// - [`Self::break_open_connections`] makes every open connection fail
///   its liveness check
/// - [`Self::set_fail_close`] makes closing connections report an error
/// - [`Self::crash`] loses all branches that were not prepared
///
/// # Statements
///
/// Statements starting with `select` are reads: they are accepted but not
/// recorded. Other statements are writes and are recorded either in the
/// branch the connection is associated with or, in auto-commit mode, in the
/// committed log.
#[derive(Clone)]
pub struct InMemoryXaDataSource {
    descriptor: ResourceDescriptor,
    shared: Arc<Shared>,
}

impl InMemoryXaDataSource {
    /// Creates a reachable resource that accepts the descriptor's credentials.
    #[must_use]
    pub fn new(descriptor: ResourceDescriptor) -> Self {
        let shared = Shared {
            endpoint: descriptor.endpoint().to_string(),
            state: Mutex::new(ResourceState {
                reachable: true,
                fail_close: false,
                accounts: vec![descriptor.credentials().clone()],
                logins: Vec::new(),
                next_connection: 1,
                opened: 0,
                open: HashSet::new(),
                broken: HashSet::new(),
                branches: HashMap::new(),
                committed: Vec::new(),
                commits: 0,
                rollbacks: 0,
            }),
        };
        Self {
            descriptor,
            shared: Arc::new(shared),
        }
    }

    /// Accepts an additional account, e.g. a dedicated recovery user.
    pub fn add_account(&self, credentials: Credentials) {
        self.shared.state.lock().accounts.push(credentials);
    }

    /// Sets whether the resource can be reached.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state.lock().reachable = reachable;
    }

    /// Sets whether closing a connection reports an error.
    pub fn set_fail_close(&self, fail: bool) {
        self.shared.state.lock().fail_close = fail;
    }

    /// Marks every currently open connection as broken.
    pub fn break_open_connections(&self) {
        let mut state = self.shared.state.lock();
        let open: Vec<u64> = state.open.iter().copied().collect();
        state.broken.extend(open);
    }

    /// Simulates a resource manager restart.
    ///
    /// Open connections break and every branch that was not prepared is
    /// lost. Prepared branches survive and are reported by `recover`.
    pub fn crash(&self) {
        let mut state = self.shared.state.lock();
        let open: Vec<u64> = state.open.iter().copied().collect();
        state.broken.extend(open);
        state
            .branches
            .retain(|_, branch| branch.state == BranchState::Prepared);
    }

    /// Returns the committed writes in commit order.
    #[must_use]
    pub fn committed_statements(&self) -> Vec<String> {
        self.shared.state.lock().committed.clone()
    }

    /// Returns the prepared branches, sorted.
    #[must_use]
    pub fn prepared_xids(&self) -> Vec<Xid> {
        let state = self.shared.state.lock();
        let mut xids: Vec<Xid> = state
            .branches
            .iter()
            .filter(|(_, b)| b.state == BranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect();
        xids.sort();
        xids
    }

    /// Returns the number of branches in any state.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.shared.state.lock().branches.len()
    }

    /// Returns the number of connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    /// Returns the number of connections opened so far.
    #[must_use]
    pub fn opened_connections(&self) -> u64 {
        self.shared.state.lock().opened
    }

    /// Returns the user names of all successful logins, in order.
    #[must_use]
    pub fn logins(&self) -> Vec<String> {
        self.shared.state.lock().logins.clone()
    }

    /// Returns the number of committed branches.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.shared.state.lock().commits
    }

    /// Returns the number of rolled back branches.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.shared.state.lock().rollbacks
    }
}

impl fmt::Debug for InMemoryXaDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryXaDataSource")
            .field("endpoint", &self.descriptor.endpoint())
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl XaDataSource for InMemoryXaDataSource {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn connect(&self, credentials: &Credentials) -> ResourceResult<Box<dyn XaConnection>> {
        let mut state = self.shared.state.lock();
        if !state.reachable {
            return Err(ResourceError::unavailable(
                &self.shared.endpoint,
                "connection refused",
            ));
        }
        if !state.accounts.iter().any(|a| a == credentials) {
            return Err(ResourceError::AuthenticationFailed {
                user: credentials.user().to_string(),
            });
        }

        let id = state.next_connection;
        state.next_connection += 1;
        state.opened += 1;
        state.open.insert(id);
        state.logins.push(credentials.user().to_string());
        drop(state);

        let resource = Arc::new(InMemoryXaResource {
            connection_id: id,
            shared: Arc::clone(&self.shared),
            current: Mutex::new(None),
        });
        Ok(Box::new(InMemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            resource,
            auto_commit: true,
            local: Vec::new(),
            pending: 0,
            closed: false,
        }))
    }
}

fn is_read(statement: &str) -> bool {
    statement
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"))
}

struct InMemoryXaResource {
    connection_id: u64,
    shared: Arc<Shared>,
    current: Mutex<Option<Xid>>,
}

impl InMemoryXaResource {
    fn unknown(xid: &Xid) -> ResourceError {
        ResourceError::xa(XaErrorCode::UnknownXid, format!("unknown branch {xid}"))
    }
}

impl XaResource for InMemoryXaResource {
    fn resource_key(&self) -> &str {
        &self.shared.endpoint
    }

    fn start(&self, xid: &Xid) -> ResourceResult<()> {
        let mut current = self.current.lock();
        if let Some(active) = current.as_ref() {
            return Err(ResourceError::xa(
                XaErrorCode::Protocol,
                format!("connection already associated with {active}"),
            ));
        }

        let mut state = self.shared.state.lock();
        if state.broken.contains(&self.connection_id) {
            return Err(ResourceError::Broken);
        }
        if state.branches.contains_key(xid) {
            return Err(ResourceError::xa(
                XaErrorCode::DuplicateXid,
                format!("branch {xid} already exists"),
            ));
        }
        state.branches.insert(
            xid.clone(),
            Branch {
                state: BranchState::Active,
                rollback_only: false,
                statements: Vec::new(),
            },
        );
        *current = Some(xid.clone());
        Ok(())
    }

    fn end(&self, xid: &Xid, success: bool) -> ResourceResult<()> {
        let mut current = self.current.lock();
        if current.as_ref() != Some(xid) {
            return Err(ResourceError::xa(
                XaErrorCode::Protocol,
                format!("branch {xid} is not associated with this connection"),
            ));
        }
        *current = None;

        let mut state = self.shared.state.lock();
        let branch = state.branches.get_mut(xid).ok_or_else(|| Self::unknown(xid))?;
        branch.state = BranchState::Ended;
        branch.rollback_only |= !success;
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> ResourceResult<Vote> {
        let mut state = self.shared.state.lock();
        let branch = state.branches.get(xid).ok_or_else(|| Self::unknown(xid))?;
        match branch.state {
            BranchState::Active => {
                return Err(ResourceError::xa(
                    XaErrorCode::Protocol,
                    format!("branch {xid} has not ended"),
                ))
            }
            BranchState::Prepared => return Ok(Vote::Commit),
            BranchState::Ended => {}
        }
        if branch.rollback_only {
            state.branches.remove(xid);
            state.rollbacks += 1;
            return Err(ResourceError::xa(
                XaErrorCode::RolledBack,
                format!("branch {xid} is rollback-only"),
            ));
        }
        if branch.statements.is_empty() {
            state.branches.remove(xid);
            return Ok(Vote::ReadOnly);
        }
        if let Some(branch) = state.branches.get_mut(xid) {
            branch.state = BranchState::Prepared;
        }
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> ResourceResult<()> {
        let mut state = self.shared.state.lock();
        let branch = state.branches.get(xid).ok_or_else(|| Self::unknown(xid))?;
        let expected = if one_phase {
            BranchState::Ended
        } else {
            BranchState::Prepared
        };
        if branch.state != expected {
            return Err(ResourceError::xa(
                XaErrorCode::Protocol,
                format!("branch {xid} is {:?}, expected {expected:?}", branch.state),
            ));
        }
        let rollback_only = branch.rollback_only;
        let branch = state.branches.remove(xid).ok_or_else(|| Self::unknown(xid))?;
        if rollback_only {
            state.rollbacks += 1;
            return Err(ResourceError::xa(
                XaErrorCode::RolledBack,
                format!("branch {xid} is rollback-only"),
            ));
        }
        state.committed.extend(branch.statements);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> ResourceResult<()> {
        {
            let mut current = self.current.lock();
            if current.as_ref() == Some(xid) {
                *current = None;
            }
        }
        let mut state = self.shared.state.lock();
        state
            .branches
            .remove(xid)
            .ok_or_else(|| Self::unknown(xid))?;
        state.rollbacks += 1;
        Ok(())
    }

    fn recover(&self) -> ResourceResult<Vec<Xid>> {
        let state = self.shared.state.lock();
        if !state.reachable {
            return Err(ResourceError::unavailable(
                &self.shared.endpoint,
                "connection refused",
            ));
        }
        let mut xids: Vec<Xid> = state
            .branches
            .iter()
            .filter(|(_, b)| b.state == BranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect();
        xids.sort();
        Ok(xids)
    }
}

struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    resource: Arc<InMemoryXaResource>,
    auto_commit: bool,
    local: Vec<String>,
    pending: usize,
    closed: bool,
}

impl InMemoryConnection {
    fn ensure_usable(&self) -> ResourceResult<()> {
        if self.closed {
            return Err(ResourceError::Closed);
        }
        if self.shared.state.lock().broken.contains(&self.id) {
            return Err(ResourceError::Broken);
        }
        Ok(())
    }
}

impl XaConnection for InMemoryConnection {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        Arc::clone(&self.resource) as Arc<dyn XaResource>
    }

    fn execute(&mut self, statement: &str) -> ResourceResult<u64> {
        self.ensure_usable()?;
        self.pending += 1;
        if is_read(statement) {
            return Ok(0);
        }

        let current = self.resource.current.lock().clone();
        let mut state = self.shared.state.lock();
        match current {
            Some(xid) => {
                let branch = state
                    .branches
                    .get_mut(&xid)
                    .ok_or_else(|| InMemoryXaResource::unknown(&xid))?;
                branch.statements.push(statement.to_string());
            }
            None if self.auto_commit => state.committed.push(statement.to_string()),
            None => self.local.push(statement.to_string()),
        }
        Ok(1)
    }

    fn ping(&mut self) -> ResourceResult<()> {
        self.ensure_usable()
    }

    fn set_auto_commit(&mut self, enabled: bool) -> ResourceResult<()> {
        self.ensure_usable()?;
        if enabled && !self.auto_commit {
            let local = std::mem::take(&mut self.local);
            self.shared.state.lock().committed.extend(local);
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn pending_statements(&self) -> usize {
        self.pending
    }

    fn reset(&mut self) -> ResourceResult<()> {
        self.ensure_usable()?;
        self.local.clear();
        self.pending = 0;
        Ok(())
    }

    fn close(&mut self) -> ResourceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.shared.state.lock();
        state.open.remove(&self.id);
        state.broken.remove(&self.id);
        if state.fail_close {
            return Err(ResourceError::unavailable(
                &self.shared.endpoint,
                "close failed",
            ));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            let mut state = self.shared.state.lock();
            state.open.remove(&self.id);
            state.broken.remove(&self.id);
        }
    }
}
