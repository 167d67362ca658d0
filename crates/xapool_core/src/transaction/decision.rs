//! Commit decisions consulted by crash recovery.

use parking_lot::RwLock;
use std::collections::HashSet;

/// What recovery knows about a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The coordinator decided to commit.
    Committed,
    /// The coordinator is still working on the transaction.
    InFlight,
    /// No decision was recorded; the transaction is presumed aborted.
    Unknown,
}

/// Durable record of commit decisions, keyed by global transaction id.
///
/// A coordinator records the decision after every branch prepared and
/// before committing any of them, and forgets it once all branches
/// committed. Anything else is presumed aborted.
pub trait DecisionLog: Send + Sync {
    /// Records the decision to commit a global transaction.
    fn record_commit(&self, gtrid: &[u8]);

    /// Drops the decision once every branch has committed.
    fn forget(&self, gtrid: &[u8]);

    /// Looks up the outcome of a global transaction.
    fn outcome(&self, gtrid: &[u8]) -> Outcome;
}

/// A decision log kept in memory.
///
/// Survives a resource crash but not a process restart, which is what
/// tests and simulations need.
#[derive(Debug, Default)]
pub struct InMemoryDecisionLog {
    committed: RwLock<HashSet<Vec<u8>>>,
}

impl InMemoryDecisionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of recorded decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    /// Returns true if no decision is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }
}

impl DecisionLog for InMemoryDecisionLog {
    fn record_commit(&self, gtrid: &[u8]) {
        self.committed.write().insert(gtrid.to_vec());
    }

    fn forget(&self, gtrid: &[u8]) {
        self.committed.write().remove(gtrid);
    }

    fn outcome(&self, gtrid: &[u8]) -> Outcome {
        if self.committed.read().contains(gtrid) {
            Outcome::Committed
        } else {
            Outcome::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_forget() {
        let log = InMemoryDecisionLog::new();
        assert!(log.is_empty());
        assert_eq!(log.outcome(b"g1"), Outcome::Unknown);

        log.record_commit(b"g1");
        assert_eq!(log.outcome(b"g1"), Outcome::Committed);
        assert_eq!(log.outcome(b"g2"), Outcome::Unknown);
        assert_eq!(log.len(), 1);

        log.forget(b"g1");
        assert_eq!(log.outcome(b"g1"), Outcome::Unknown);
        assert!(log.is_empty());
    }
}
