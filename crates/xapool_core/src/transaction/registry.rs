//! Per-transaction record of enlisted connections.

use crate::error::{CoreError, CoreResult};
use crate::factory::XaPooledConnection;
use crate::pool::PooledObject;
use crate::types::{ConnectionId, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use xapool_resource::Xid;

type Recycler = Box<dyn Fn(PooledConnection) + Send + Sync>;

/// A pooled XA connection as handed out by the pool.
pub type PooledConnection = PooledObject<XaPooledConnection>;

/// An enlisted branch as seen from outside the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enlistment {
    /// The transaction.
    pub transaction: TransactionId,
    /// The resource key.
    pub resource: String,
    /// The branch XID.
    pub xid: Xid,
    /// The connection carrying the branch.
    pub connection: ConnectionId,
    /// True if the borrower released the connection and it waits in the
    /// registry for reuse or transaction completion.
    pub parked: bool,
}

/// Outcome of [`TransactionRegistry::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The transaction's enlisted connection to this resource, handed back
    /// for reuse. It is still enlisted and must not be enlisted again.
    Parked(PooledConnection),
    /// No connection is enlisted yet; the caller must enlist one and
    /// [`TransactionRegistry::record`] it, or
    /// [`TransactionRegistry::release_claim`] on failure.
    Fresh {
        /// True for the first claim of the transaction. The caller must
        /// register a completion callback that calls
        /// [`TransactionRegistry::complete`].
        needs_synchronization: bool,
    },
}

enum Slot {
    Enlisting,
    OnLoan { xid: Xid, connection: ConnectionId },
    Parked { xid: Xid, conn: PooledConnection },
}

#[derive(Default)]
struct Entry {
    completed: bool,
    synchronized: bool,
    branches: HashMap<String, Slot>,
}

/// Tracks which connection carries each transaction's branch on each
/// resource.
///
/// At most one branch exists per (transaction, resource). A connection
/// whose borrower released it while the transaction is still active is
/// parked here, so the next request in the same transaction gets the same
/// physical connection and no second branch is started.
///
/// Unrelated transactions only share the outer read lock; requests of
/// one transaction serialize on that transaction's entry.
#[derive(Default)]
pub struct TransactionRegistry {
    entries: RwLock<HashMap<TransactionId, Arc<Mutex<Entry>>>>,
    recycler: RwLock<Option<Recycler>>,
}

impl TransactionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, txid: TransactionId) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().get(&txid).cloned()
    }

    /// Sets where [`Self::release`] sends the connections it frees.
    ///
    /// Without a recycler freed connections are dropped.
    pub fn set_recycler<F>(&self, recycler: F)
    where
        F: Fn(PooledConnection) + Send + Sync + 'static,
    {
        *self.recycler.write() = Some(Box::new(recycler));
    }

    /// Hands a connection to the recycler.
    pub fn recycle(&self, conn: PooledConnection) {
        match self.recycler.read().as_ref() {
            Some(recycler) => recycler(conn),
            None => debug!(connection = %conn.connection_id(), "no recycler, dropping connection"),
        }
    }

    /// Takes the transaction's parked connection to a resource, if any.
    ///
    /// The connection counts as on loan again afterwards.
    pub fn take_parked(&self, txid: TransactionId, resource: &str) -> Option<PooledConnection> {
        let entry = self.entry(txid)?;
        let mut entry = entry.lock();
        if entry.completed || !matches!(entry.branches.get(resource), Some(Slot::Parked { .. })) {
            return None;
        }
        match entry.branches.remove(resource)? {
            Slot::Parked { xid, conn } => {
                let connection = conn.connection_id();
                entry
                    .branches
                    .insert(resource.to_string(), Slot::OnLoan { xid, connection });
                Some(conn)
            }
            slot => {
                entry.branches.insert(resource.to_string(), slot);
                None
            }
        }
    }

    /// Claims the (transaction, resource) slot for a connection request.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConnectionInUse`] if the transaction's
    /// connection to this resource is on loan or being enlisted.
    pub fn claim(&self, txid: TransactionId, resource: &str) -> CoreResult<Claim> {
        let entry = match self.entry(txid) {
            Some(entry) => entry,
            None => self
                .entries
                .write()
                .entry(txid)
                .or_insert_with(|| Arc::new(Mutex::new(Entry::default())))
                .clone(),
        };

        let mut entry = entry.lock();
        if entry.completed {
            return Err(CoreError::TransactionNotActive(txid));
        }

        match entry.branches.remove(resource) {
            Some(Slot::Parked { xid, conn }) => {
                let connection = conn.connection_id();
                entry
                    .branches
                    .insert(resource.to_string(), Slot::OnLoan { xid, connection });
                Ok(Claim::Parked(conn))
            }
            Some(slot) => {
                entry.branches.insert(resource.to_string(), slot);
                Err(CoreError::ConnectionInUse {
                    transaction: txid,
                    resource: resource.to_string(),
                })
            }
            None => {
                entry
                    .branches
                    .insert(resource.to_string(), Slot::Enlisting);
                let needs_synchronization = !entry.synchronized;
                entry.synchronized = true;
                Ok(Claim::Fresh {
                    needs_synchronization,
                })
            }
        }
    }

    /// Records the branch of a connection enlisted after a fresh claim.
    pub fn record(&self, txid: TransactionId, resource: &str, xid: Xid, connection: ConnectionId) {
        if let Some(entry) = self.entry(txid) {
            entry
                .lock()
                .branches
                .insert(resource.to_string(), Slot::OnLoan { xid, connection });
        }
    }

    /// Gives up a fresh claim whose enlistment failed.
    ///
    /// The transaction stays tracked until its completion callback runs.
    pub fn release_claim(&self, txid: TransactionId, resource: &str) {
        if let Some(entry) = self.entry(txid) {
            let mut entry = entry.lock();
            if matches!(entry.branches.get(resource), Some(Slot::Enlisting)) {
                entry.branches.remove(resource);
            }
        }
    }

    /// Parks a released connection until the transaction completes.
    ///
    /// # Errors
    ///
    /// Hands the connection back if the transaction already completed or
    /// does not own it; the caller returns it to the pool.
    pub fn park(
        &self,
        txid: TransactionId,
        resource: &str,
        conn: PooledConnection,
    ) -> Result<(), PooledConnection> {
        let Some(entry) = self.entry(txid) else {
            return Err(conn);
        };
        let mut entry = entry.lock();
        if entry.completed {
            return Err(conn);
        }
        match entry.branches.remove(resource) {
            Some(Slot::OnLoan { xid, connection }) if connection == conn.connection_id() => {
                entry
                    .branches
                    .insert(resource.to_string(), Slot::Parked { xid, conn });
                Ok(())
            }
            Some(slot) => {
                entry.branches.insert(resource.to_string(), slot);
                Err(conn)
            }
            None => Err(conn),
        }
    }

    /// Ends tracking of a transaction and returns its parked connections.
    ///
    /// Connections still on loan are handed back to the pool by their
    /// borrowers, since [`Self::park`] fails from now on.
    pub fn complete(&self, txid: TransactionId) -> Vec<PooledConnection> {
        let Some(entry) = self.entries.write().remove(&txid) else {
            return Vec::new();
        };
        let mut entry = entry.lock();
        entry.completed = true;
        entry
            .branches
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Parked { conn, .. } => Some(conn),
                Slot::Enlisting | Slot::OnLoan { .. } => None,
            })
            .collect()
    }

    /// Completes a transaction and recycles its parked connections.
    ///
    /// This is what the completion callback of every transaction runs.
    pub fn release(&self, txid: TransactionId) {
        for conn in self.complete(txid) {
            debug!(transaction = %txid, connection = %conn.connection_id(), "releasing parked connection");
            self.recycle(conn);
        }
    }

    /// Returns the enlistment of a transaction on a resource.
    #[must_use]
    pub fn lookup(&self, txid: TransactionId, resource: &str) -> Option<Enlistment> {
        let entry = self.entry(txid)?;
        let entry = entry.lock();
        let (xid, connection, parked) = match entry.branches.get(resource)? {
            Slot::Enlisting => return None,
            Slot::OnLoan { xid, connection } => (xid.clone(), *connection, false),
            Slot::Parked { xid, conn } => (xid.clone(), conn.connection_id(), true),
        };
        Some(Enlistment {
            transaction: txid,
            resource: resource.to_string(),
            xid,
            connection,
            parked,
        })
    }

    /// Returns true if the transaction has a branch on the resource.
    #[must_use]
    pub fn is_enlisted(&self, txid: TransactionId, resource: &str) -> bool {
        self.lookup(txid, resource).is_some()
    }

    /// Returns the number of branches recorded for a transaction.
    #[must_use]
    pub fn enlisted_count(&self, txid: TransactionId) -> usize {
        self.entry(txid).map_or(0, |entry| {
            entry
                .lock()
                .branches
                .values()
                .filter(|slot| !matches!(slot, Slot::Enlisting))
                .count()
        })
    }

    /// Returns the transactions currently tracked.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.entries.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("transactions", &self.entries.read().len())
            .finish()
    }
}
