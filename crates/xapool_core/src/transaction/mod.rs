//! Transaction coordination.
//!
//! This module provides:
//! - The [`TransactionManager`] interface the pool enlists connections with
//! - [`LocalTransactionManager`], an in-process presumed-abort coordinator
//! - The [`DecisionLog`] consulted by crash recovery
//! - The [`TransactionRegistry`] tracking enlisted connections per transaction
//!
//! The current transaction is always passed explicitly as a
//! [`TransactionContext`]; nothing is bound to the calling thread.

mod context;
mod decision;
mod local;
mod registry;

pub use context::{
    Synchronization, TransactionContext, TransactionManager, TransactionStatus, FORMAT_ID,
};
pub use decision::{DecisionLog, InMemoryDecisionLog, Outcome};
pub use local::LocalTransactionManager;
pub use registry::{Claim, Enlistment, PooledConnection, TransactionRegistry};
