//! Periodic background tasks.
//!
//! Used by the pool evictor and the recovery scanner. A task holds only a
//! weak reference to its owner, so dropping the owner ends the task at its
//! next tick even if `stop` was never called.

use parking_lot::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A named thread that runs a callback at a fixed interval.
pub(crate) struct PeriodicTask {
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawns a task calling `tick` every `interval` while `owner` is alive.
    pub(crate) fn spawn<T, F>(
        name: &str,
        interval: Duration,
        owner: Weak<T>,
        tick: F,
    ) -> std::io::Result<Self>
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    // stop requested or task handle dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match owner.upgrade() {
                    Some(owner) => tick(&owner),
                    None => break,
                }
            })?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops the task and waits for the running tick to finish.
    ///
    /// Calling this from the task's own thread only signals the stop.
    pub(crate) fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Returns true until `stop` has been called.
    pub(crate) fn is_running(&self) -> bool {
        self.stop_tx.lock().is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
