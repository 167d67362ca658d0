//! Crash recovery scenarios.
//!
//! Leaves prepared branches behind on a resource, records commit
//! decisions for some of them and restarts the resource, so recovery can
//! be checked against a known set of outcomes.

use crate::fixtures::{coordinator_xid, leave_in_doubt};
use xapool_core::DecisionLog;
use xapool_resource::{InMemoryXaDataSource, Xid};

/// Branches left in doubt by a simulated coordinator crash.
#[derive(Debug, Clone, Default)]
pub struct CrashScenario {
    /// Branches whose commit decision was logged before the crash.
    pub decided: Vec<Xid>,
    /// Branches prepared without a logged decision.
    pub orphaned: Vec<Xid>,
}

impl CrashScenario {
    /// Prepares `decided + orphaned` branches on `source`, logs a commit
    /// for the first `decided` and crashes the resource.
    ///
    /// Each branch writes one statement naming its global transaction.
    pub fn stage(
        source: &InMemoryXaDataSource,
        log: &dyn DecisionLog,
        decided: usize,
        orphaned: usize,
    ) -> Self {
        let mut scenario = Self::default();
        for n in 0..decided + orphaned {
            let gtrid = format!("crashed-{n}");
            let xid = coordinator_xid(gtrid.as_bytes(), 1);
            leave_in_doubt(source, &xid, &Self::statement(&xid));
            if n < decided {
                log.record_commit(xid.gtrid());
                scenario.decided.push(xid);
            } else {
                scenario.orphaned.push(xid);
            }
        }
        source.crash();
        scenario
    }

    /// The statement written by `xid`'s branch.
    #[must_use]
    pub fn statement(xid: &Xid) -> String {
        format!("insert into t values ('{}')", String::from_utf8_lossy(xid.gtrid()))
    }

    /// Statements that recovery must commit, in staging order.
    #[must_use]
    pub fn expected_commits(&self) -> Vec<String> {
        self.decided.iter().map(Self::statement).collect()
    }

    /// Total number of branches left in doubt.
    #[must_use]
    pub fn in_doubt(&self) -> usize {
        self.decided.len() + self.orphaned.len()
    }
}
