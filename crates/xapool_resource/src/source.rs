//! XA data source, connection and resource traits.

use crate::credentials::{Credentials, ResourceDescriptor};
use crate::error::ResourceResult;
use crate::xid::Xid;
use std::sync::Arc;

/// Outcome of the prepare phase for one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The branch is prepared and must be committed or rolled back.
    Commit,
    /// The branch made no changes; nothing remains to be done for it.
    ReadOnly,
}

/// The XA branch interface of a resource manager.
///
/// A coordinator drives branches through this handle. Implementations use
/// interior mutability because the same handle is shared between the
/// connection that produced it, the transaction manager and the recovery
/// scanner.
///
/// # Invariants
///
/// - `start` associates the branch with the connection that owns this
///   handle; statements executed afterwards belong to the branch
/// - `end` dissociates the branch; `success == false` marks it rollback-only
/// - `prepare` persists the branch so that it survives a crash and shows
///   up in `recover`
/// - `commit`/`rollback` of an unknown XID fails with
///   [`crate::XaErrorCode::UnknownXid`]
pub trait XaResource: Send + Sync {
    /// Returns the key of the resource manager behind this handle.
    fn resource_key(&self) -> &str;

    /// Starts work on behalf of a branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the XID is already in use or the resource failed.
    fn start(&self, xid: &Xid) -> ResourceResult<()>;

    /// Ends work on behalf of a branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the branch is not associated with this handle.
    fn end(&self, xid: &Xid, success: bool) -> ResourceResult<()>;

    /// Asks the resource manager to prepare the branch.
    ///
    /// # Errors
    ///
    /// Returns an XA error if the branch was rolled back or is unknown.
    fn prepare(&self, xid: &Xid) -> ResourceResult<Vote>;

    /// Commits the branch, in one phase if `one_phase` is set.
    ///
    /// # Errors
    ///
    /// Returns an XA error if the branch is unknown or the commit failed.
    fn commit(&self, xid: &Xid, one_phase: bool) -> ResourceResult<()>;

    /// Rolls back the branch.
    ///
    /// # Errors
    ///
    /// Returns an XA error if the branch is unknown.
    fn rollback(&self, xid: &Xid) -> ResourceResult<()>;

    /// Lists the prepared (in-doubt) branches known to the resource manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource manager cannot be queried.
    fn recover(&self) -> ResourceResult<Vec<Xid>>;
}

/// A physical connection to an XA resource.
pub trait XaConnection: Send {
    /// Returns the XA branch handle of this connection.
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Executes a statement and returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed, broken, or the
    /// statement fails.
    fn execute(&mut self, statement: &str) -> ResourceResult<u64>;

    /// Performs a lightweight liveness check.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection no longer responds.
    fn ping(&mut self) -> ResourceResult<()>;

    /// Sets whether statements outside a branch commit immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    fn set_auto_commit(&mut self, enabled: bool) -> ResourceResult<()>;

    /// Returns the number of statements executed since the last reset.
    fn pending_statements(&self) -> usize;

    /// Clears per-use state such as pending statements and open cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or broken.
    fn reset(&mut self) -> ResourceResult<()>;

    /// Closes the physical connection.
    ///
    /// # Errors
    ///
    /// Returns an error if closing failed; the connection is unusable
    /// afterwards either way.
    fn close(&mut self) -> ResourceResult<()>;

    /// Returns true if the connection has been closed.
    fn is_closed(&self) -> bool;
}

/// A factory of physical XA connections for one resource.
pub trait XaDataSource: Send + Sync {
    /// Returns the descriptor of the backing resource.
    fn descriptor(&self) -> &ResourceDescriptor;

    /// Opens a new physical connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ResourceError::Unavailable`] if the resource cannot
    /// be reached and [`crate::ResourceError::AuthenticationFailed`] if the
    /// credentials are rejected.
    fn connect(&self, credentials: &Credentials) -> ResourceResult<Box<dyn XaConnection>>;
}
