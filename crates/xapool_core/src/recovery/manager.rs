//! Recovery registry and in-doubt resolution.

use crate::error::{CoreError, CoreResult};
use crate::recovery::helper::{RecoveryHelper, RecoveryScan};
use crate::transaction::{DecisionLog, Outcome, FORMAT_ID};
use crate::worker::PeriodicTask;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use xapool_resource::XaErrorCode;

/// Result of [`RecoveryManager::register_helper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The helper was added.
    Registered,
    /// A helper for the same resource was already registered; nothing changed.
    AlreadyRegistered,
}

/// Lifecycle of a [`RecoveryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Accepting registrations, no background scanning.
    Created,
    /// Scanning periodically.
    Running,
    /// Shut down. Registered helpers are kept but no longer scanned.
    Stopped,
}

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Helpers asked for in-doubt branches.
    pub helpers_scanned: usize,
    /// Branches committed because the commit decision was logged.
    pub committed: usize,
    /// Branches rolled back because no decision was logged.
    pub rolled_back: usize,
    /// Branches left alone because their transaction is still completing.
    pub skipped: usize,
    /// Helpers or branches that could not be handled.
    pub failures: usize,
}

impl RecoveryReport {
    /// Returns the number of branches resolved in this pass.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.committed + self.rolled_back
    }
}

/// Registry of recovery helpers, one per resource.
///
/// Helpers are registered once and never removed. A scan resolves every
/// prepared branch created by this crate (format id [`FORMAT_ID`]) against
/// the decision log: logged commits are committed, transactions still
/// completing are skipped and everything else is rolled back.
pub struct RecoveryManager {
    log: Arc<dyn DecisionLog>,
    helpers: Mutex<BTreeMap<String, Arc<dyn RecoveryHelper>>>,
    state: Mutex<RecoveryState>,
    scan_lock: Mutex<()>,
    task: Mutex<Option<PeriodicTask>>,
}

impl RecoveryManager {
    /// Creates a manager resolving branches against `log`.
    pub fn new(log: Arc<dyn DecisionLog>) -> Self {
        Self {
            log,
            helpers: Mutex::new(BTreeMap::new()),
            state: Mutex::new(RecoveryState::Created),
            scan_lock: Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Registers the helper of a resource.
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// registrations for the same resource add exactly one helper.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecoveryUnavailable`] after [`Self::shutdown`].
    pub fn register_helper(&self, helper: Arc<dyn RecoveryHelper>) -> CoreResult<Registration> {
        let mut helpers = self.helpers.lock();
        if *self.state.lock() == RecoveryState::Stopped {
            return Err(CoreError::recovery_unavailable(
                "recovery manager has been shut down",
            ));
        }

        match helpers.entry(helper.resource_key().to_string()) {
            Entry::Occupied(entry) => {
                debug!(resource = %entry.key(), "recovery helper already registered");
                Ok(Registration::AlreadyRegistered)
            }
            Entry::Vacant(entry) => {
                info!(resource = %entry.key(), "recovery helper registered");
                entry.insert(helper);
                Ok(Registration::Registered)
            }
        }
    }

    /// Returns true if a helper is registered for the resource.
    #[must_use]
    pub fn is_registered(&self, resource: &str) -> bool {
        self.helpers.lock().contains_key(resource)
    }

    /// Returns the number of registered helpers.
    #[must_use]
    pub fn helper_count(&self) -> usize {
        self.helpers.lock().len()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    /// Runs one recovery pass over every registered helper.
    ///
    /// Passes never overlap. A failing helper is counted and logged; the
    /// remaining helpers are still scanned.
    pub fn scan(&self) -> RecoveryReport {
        let _pass = self.scan_lock.lock();
        let helpers: Vec<Arc<dyn RecoveryHelper>> = self.helpers.lock().values().cloned().collect();

        let mut report = RecoveryReport::default();
        for helper in helpers {
            report.helpers_scanned += 1;
            match helper.scan() {
                Ok(scan) => self.resolve(&scan, &mut report),
                Err(e) => {
                    warn!(resource = helper.resource_key(), error = %e, "recovery scan failed");
                    report.failures += 1;
                }
            }
        }

        if report.resolved() > 0 || report.failures > 0 {
            info!(
                helpers = report.helpers_scanned,
                committed = report.committed,
                rolled_back = report.rolled_back,
                skipped = report.skipped,
                failures = report.failures,
                "recovery pass finished"
            );
        } else {
            debug!(helpers = report.helpers_scanned, skipped = report.skipped, "recovery pass found nothing to do");
        }
        report
    }

    fn resolve(&self, scan: &RecoveryScan, report: &mut RecoveryReport) {
        let resource = scan.resource_key();
        for xid in scan.in_doubt() {
            if xid.format_id() != FORMAT_ID {
                debug!(resource, %xid, "ignoring branch of another coordinator");
                continue;
            }

            let result = match self.log.outcome(xid.gtrid()) {
                Outcome::InFlight => {
                    debug!(resource, %xid, "transaction still completing");
                    report.skipped += 1;
                    continue;
                }
                Outcome::Committed => scan.commit(xid).map(|()| {
                    report.committed += 1;
                }),
                Outcome::Unknown => scan.rollback(xid).map(|()| {
                    report.rolled_back += 1;
                }),
            };

            match result {
                Ok(()) => debug!(resource, %xid, "in-doubt branch resolved"),
                Err(CoreError::Resource(e)) if e.xa_code() == Some(XaErrorCode::UnknownXid) => {
                    debug!(resource, %xid, "branch already resolved");
                }
                Err(e) => {
                    warn!(resource, %xid, error = %e, "failed to resolve in-doubt branch");
                    report.failures += 1;
                }
            }
        }
    }

    /// Starts periodic recovery passes on a background thread.
    ///
    /// Calling this on a running manager does nothing.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidConfig`] for a zero interval
    /// - [`CoreError::RecoveryUnavailable`] after [`Self::shutdown`]
    /// - [`CoreError::Io`] if the thread cannot be spawned
    pub fn start(self: &Arc<Self>, interval: Duration) -> CoreResult<()> {
        if interval.is_zero() {
            return Err(CoreError::invalid_config("recovery interval must be non-zero"));
        }

        let mut state = self.state.lock();
        match *state {
            RecoveryState::Running => return Ok(()),
            RecoveryState::Stopped => {
                return Err(CoreError::recovery_unavailable(
                    "recovery manager has been shut down",
                ))
            }
            RecoveryState::Created => {}
        }

        let task = PeriodicTask::spawn("xapool-recovery", interval, Arc::downgrade(self), |manager: &RecoveryManager| {
            manager.scan();
        })?;
        *self.task.lock() = Some(task);
        *state = RecoveryState::Running;
        info!(?interval, "recovery scanning started");
        Ok(())
    }

    /// Stops background scanning. Registered helpers stay registered.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), RecoveryState::Stopped);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop();
        }
        if previous != RecoveryState::Stopped {
            info!(helpers = self.helper_count(), "recovery manager shut down");
        }
    }
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("state", &self.state())
            .field("helpers", &self.helpers.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
