//! Transaction manager interface.

use crate::error::CoreResult;
use crate::types::TransactionId;
use std::fmt;
use std::sync::Arc;
use xapool_resource::{XaResource, Xid};

/// Format id of every XID created by xapool transaction managers.
///
/// Recovery only resolves in-doubt branches carrying this format id;
/// branches of other coordinators are left alone.
pub const FORMAT_ID: i32 = 0x5841_504c; // "XAPL"

/// Status of a transaction as seen by its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// The transaction accepts work.
    Active,
    /// The transaction accepts work but can only roll back.
    MarkedRollback,
    /// Branches are being prepared.
    Preparing,
    /// The commit decision was taken; branches are being committed.
    Committing,
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
    /// The manager does not know this transaction.
    NoTransaction,
}

impl TransactionStatus {
    /// Returns true if connections may still be enlisted.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// Returns true once the transaction has an outcome.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Handle of a transaction, passed explicitly to the data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionContext {
    id: TransactionId,
    gtrid: [u8; 16],
}

impl TransactionContext {
    /// Creates a context from a transaction id and global transaction id.
    #[must_use]
    pub const fn new(id: TransactionId, gtrid: [u8; 16]) -> Self {
        Self { id, gtrid }
    }

    /// Returns the transaction id.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the global transaction id shared by all branches.
    #[must_use]
    pub const fn gtrid(&self) -> &[u8; 16] {
        &self.gtrid
    }
}

impl fmt::Display for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

/// Callback run once a transaction has completed.
pub trait Synchronization: Send {
    /// Called with the final status, after all branches were resolved.
    fn after_completion(self: Box<Self>, status: TransactionStatus);
}

impl<F> Synchronization for F
where
    F: FnOnce(TransactionStatus) + Send,
{
    fn after_completion(self: Box<Self>, status: TransactionStatus) {
        (*self)(status);
    }
}

/// The transaction manager the pool enlists connections with.
///
/// # Invariants
///
/// - `enlist` starts the branch on the given resource before returning
/// - every registered synchronization runs exactly once, after completion
pub trait TransactionManager: Send + Sync {
    /// Returns the status of a transaction.
    fn status(&self, ctx: &TransactionContext) -> TransactionStatus;

    /// Returns true if connections may be enlisted in the transaction.
    fn is_active(&self, ctx: &TransactionContext) -> bool {
        self.status(ctx).is_active()
    }

    /// Enlists a resource as a new branch of the transaction.
    ///
    /// Returns the branch XID, already started on the resource.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::TransactionNotActive`] if the
    /// transaction no longer accepts work and
    /// [`crate::CoreError::Enlistment`] if the resource refused the branch.
    fn enlist(&self, ctx: &TransactionContext, resource: Arc<dyn XaResource>) -> CoreResult<Xid>;

    /// Registers a callback to run after the transaction completes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::TransactionNotActive`] if the
    /// transaction is not active.
    fn register_synchronization(
        &self,
        ctx: &TransactionContext,
        sync: Box<dyn Synchronization>,
    ) -> CoreResult<()>;

    /// Marks the transaction so that it can only roll back.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::TransactionNotActive`] if the
    /// transaction is not active.
    fn set_rollback_only(&self, ctx: &TransactionContext) -> CoreResult<()>;
}
