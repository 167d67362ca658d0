//! Crash recovery.
//!
//! Every wrapped resource registers a [`RecoveryHelper`] with the shared
//! [`RecoveryManager`]. After a crash, a recovery pass lists the branches
//! left prepared on each resource and finishes them according to the
//! transaction manager's [`crate::DecisionLog`].

mod helper;
mod manager;

pub use helper::{DataSourceRecoveryHelper, RecoveryHelper, RecoveryScan};
pub use manager::{RecoveryManager, RecoveryReport, RecoveryState, Registration};
