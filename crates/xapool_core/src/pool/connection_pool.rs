//! Bounded, blocking object pool.

use crate::config::{IdleOrder, PoolConfig};
use crate::error::{CoreError, CoreResult};
use crate::pool::object::{PooledObject, PooledObjectFactory};
use crate::worker::PeriodicTask;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Objects waiting in the idle queue.
    pub idle: usize,
    /// Objects on loan.
    pub active: usize,
    /// Every object the pool accounts for, including ones being created
    /// or destroyed. Never exceeds `max_total`.
    pub total: usize,
    /// Borrowers waiting for an object.
    pub waiters: usize,
    /// Objects created over the pool's lifetime.
    pub created: u64,
    /// Objects destroyed over the pool's lifetime.
    pub destroyed: u64,
    /// Successful borrows over the pool's lifetime.
    pub borrowed: u64,
}

/// Result of one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Idle objects inspected.
    pub examined: usize,
    /// Idle objects destroyed because they expired or failed validation.
    pub evicted: usize,
    /// Objects created to restore `min_idle`.
    pub created: usize,
}

struct PoolState<T> {
    idle: VecDeque<PooledObject<T>>,
    active: usize,
    creating: usize,
    destroying: usize,
    evicting: usize,
    closed: bool,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    next_id: u64,
    created: u64,
    destroyed: u64,
    borrowed: u64,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.creating + self.destroying + self.evicting
    }

    fn take_idle(&mut self, order: IdleOrder) -> Option<PooledObject<T>> {
        match order {
            IdleOrder::Lifo => self.idle.pop_back(),
            IdleOrder::Fifo => self.idle.pop_front(),
        }
    }

    fn leave_queue(&mut self, ticket: u64) {
        self.waiters.retain(|t| *t != ticket);
    }
}

struct PoolShared<F: PooledObjectFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Object>>,
    available: Condvar,
    evictor: Mutex<Option<PeriodicTask>>,
}

enum Acquired<T> {
    Idle(PooledObject<T>),
    Create(u64),
}

/// A bounded pool of objects made by a [`PooledObjectFactory`].
///
/// Cloning the pool produces another handle to the same pool.
///
/// # Guarantees
///
/// - At most `max_total` objects exist at any time, counting objects that
///   are being created or destroyed
/// - An object is never lent to two borrowers at once
/// - Blocked borrowers are served in arrival order
/// - Factory hooks run outside the pool lock
///
/// # Example
///
/// ```rust
/// use xapool_core::{ConnectionPool, CoreResult, PoolConfig, PooledObject, PooledObjectFactory};
///
/// struct Numbers;
///
/// impl PooledObjectFactory for Numbers {
///     type Object = u32;
///     fn make_object(&self) -> CoreResult<u32> { Ok(42) }
///     fn validate_object(&self, _: &mut PooledObject<u32>) -> CoreResult<()> { Ok(()) }
///     fn destroy_object(&self, _: PooledObject<u32>) -> CoreResult<()> { Ok(()) }
/// }
///
/// let pool = ConnectionPool::new(Numbers, PoolConfig::new().max_total(1)).unwrap();
/// let n = pool.borrow().unwrap();
/// assert_eq!(*n, 42);
/// pool.give_back(n);
/// assert_eq!(pool.stats().idle, 1);
/// ```
pub struct ConnectionPool<F: PooledObjectFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: PooledObjectFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: PooledObjectFactory> ConnectionPool<F> {
    /// Creates a pool and starts its evictor if configured.
    ///
    /// The pool starts empty; call [`Self::prefill`] to create `min_idle`
    /// objects eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for an inconsistent
    /// configuration and [`CoreError::Io`] if the evictor thread cannot be
    /// spawned.
    pub fn new(factory: F, config: PoolConfig) -> CoreResult<Self> {
        config.validate()?;
        let interval = config.eviction_interval;
        let shared = Arc::new(PoolShared {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                creating: 0,
                destroying: 0,
                evicting: 0,
                closed: false,
                waiters: VecDeque::new(),
                next_ticket: 0,
                next_id: 1,
                created: 0,
                destroyed: 0,
                borrowed: 0,
            }),
            available: Condvar::new(),
            evictor: Mutex::new(None),
        });

        if !interval.is_zero() {
            let task = PeriodicTask::spawn(
                "xapool-evictor",
                interval,
                Arc::downgrade(&shared),
                |shared: &PoolShared<F>| {
                    let report = shared.evict();
                    if report.evicted > 0 || report.created > 0 {
                        debug!(
                            examined = report.examined,
                            evicted = report.evicted,
                            created = report.created,
                            "eviction sweep"
                        );
                    }
                },
            )?;
            *shared.evictor.lock() = Some(task);
        }

        Ok(Self { shared })
    }

    /// Borrows an object, waiting up to `max_wait` for one.
    ///
    /// Idle objects that fail activation or validation are destroyed and
    /// the borrower tries again without losing its place in the queue.
    ///
    /// # Errors
    ///
    /// - [`CoreError::PoolExhausted`] if nothing became available in time
    /// - [`CoreError::PoolClosed`] if the pool is or gets closed
    /// - the factory's error if a new object could not be created
    pub fn borrow(&self) -> CoreResult<PooledObject<F::Object>> {
        self.shared.borrow()
    }

    /// Returns a borrowed object to the pool.
    ///
    /// The object is passivated and, with `test_on_return` (the default),
    /// validated. It is destroyed instead of recycled if either fails or
    /// the pool is closed.
    pub fn give_back(&self, obj: PooledObject<F::Object>) {
        self.shared.give_back(obj);
    }

    /// Destroys a borrowed object that is known to be broken.
    pub fn invalidate(&self, obj: PooledObject<F::Object>) {
        self.shared.retire_active(obj, "invalidated");
    }

    /// Runs one eviction sweep.
    pub fn evict(&self) -> EvictionReport {
        self.shared.evict()
    }

    /// Creates idle objects until `min_idle` is reached.
    ///
    /// Returns the number of objects created.
    ///
    /// # Errors
    ///
    /// Returns the first creation error. Objects created before it stay
    /// in the pool.
    pub fn prefill(&self) -> CoreResult<usize> {
        let (created, error) = self.shared.ensure_min_idle();
        match error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Closes the pool.
    ///
    /// Blocked and future borrowers fail with [`CoreError::PoolClosed`],
    /// idle objects are destroyed, and objects given back later are
    /// destroyed on return. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns true once the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            total: state.total(),
            waiters: state.waiters.len(),
            created: state.created,
            destroyed: state.destroyed,
            borrowed: state.borrowed,
        }
    }

    /// Returns the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns the object factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }
}

impl<F: PooledObjectFactory> ConnectionPool<F> {
    /// Returns a handle that does not keep the pool alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionPool<F> {
        WeakConnectionPool {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// A non-owning handle to a [`ConnectionPool`].
pub struct WeakConnectionPool<F: PooledObjectFactory> {
    shared: Weak<PoolShared<F>>,
}

impl<F: PooledObjectFactory> WeakConnectionPool<F> {
    /// Returns the pool if it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionPool<F>> {
        self.shared.upgrade().map(|shared| ConnectionPool { shared })
    }
}

impl<F: PooledObjectFactory> Clone for WeakConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<F: PooledObjectFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

enum Prepared<T> {
    Ready(PooledObject<T>),
    Retry,
    Failed(CoreError),
}

impl<F: PooledObjectFactory> PoolShared<F> {
    fn borrow(&self) -> CoreResult<PooledObject<F::Object>> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait;

        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            let Some(acquired) = self.acquire(&mut state, ticket, deadline, started)? else {
                self.available.wait_until(&mut state, deadline);
                continue;
            };

            // our ticket left the queue; the next waiter may proceed
            self.available.notify_all();
            match MutexGuard::unlocked(&mut state, || self.prepare(acquired)) {
                Prepared::Ready(obj) => {
                    if state.closed {
                        drop(state);
                        self.retire_active(obj, "pool closed");
                        return Err(CoreError::PoolClosed);
                    }
                    state.borrowed += 1;
                    return Ok(obj);
                }
                Prepared::Retry => state.waiters.push_front(ticket),
                Prepared::Failed(e) => return Err(e),
            }
        }
    }

    /// Takes an idle object or reserves a creation slot for `ticket`.
    ///
    /// `Ok(None)` means the borrower has to wait.
    fn acquire(
        &self,
        state: &mut PoolState<F::Object>,
        ticket: u64,
        deadline: Instant,
        started: Instant,
    ) -> CoreResult<Option<Acquired<F::Object>>> {
        if state.closed {
            state.leave_queue(ticket);
            self.available.notify_all();
            return Err(CoreError::PoolClosed);
        }

        if state.waiters.front() == Some(&ticket) {
            if let Some(obj) = state.take_idle(self.config.idle_order) {
                state.waiters.pop_front();
                state.active += 1;
                return Ok(Some(Acquired::Idle(obj)));
            }
            if state.total() < self.config.max_total {
                state.waiters.pop_front();
                state.creating += 1;
                let id = state.next_id;
                state.next_id += 1;
                return Ok(Some(Acquired::Create(id)));
            }
        }

        if Instant::now() >= deadline {
            state.leave_queue(ticket);
            self.available.notify_all();
            return Err(CoreError::PoolExhausted {
                max_total: self.config.max_total,
                waited: started.elapsed(),
            });
        }
        Ok(None)
    }

    fn prepare(&self, acquired: Acquired<F::Object>) -> Prepared<F::Object> {
        match acquired {
            Acquired::Idle(mut obj) => match self.activate(&mut obj) {
                Ok(()) => {
                    obj.mark_borrowed();
                    Prepared::Ready(obj)
                }
                Err(e) => {
                    debug!(id = obj.id(), error = %e, "idle object rejected on borrow");
                    self.retire_active(obj, "rejected on borrow");
                    Prepared::Retry
                }
            },
            Acquired::Create(id) => {
                let object = match self.factory.make_object() {
                    Ok(object) => object,
                    Err(e) => {
                        self.state.lock().creating -= 1;
                        self.available.notify_all();
                        return Prepared::Failed(e);
                    }
                };

                let mut obj = PooledObject::new(id, object);
                {
                    let mut state = self.state.lock();
                    state.creating -= 1;
                    state.active += 1;
                    state.created += 1;
                }
                debug!(id, "pooled object created");

                match self.activate(&mut obj) {
                    Ok(()) => {
                        obj.mark_borrowed();
                        Prepared::Ready(obj)
                    }
                    Err(e) => {
                        self.retire_active(obj, "new object rejected");
                        let e = match e {
                            CoreError::ConnectionValidationFailed { reason, .. } => {
                                CoreError::resource_unavailable(format!(
                                    "new object failed validation: {reason}"
                                ))
                            }
                            other => other,
                        };
                        Prepared::Failed(e)
                    }
                }
            }
        }
    }

    fn activate(&self, obj: &mut PooledObject<F::Object>) -> CoreResult<()> {
        self.factory.activate_object(obj)?;
        if self.config.test_on_borrow {
            self.factory.validate_object(obj)?;
            obj.mark_validated();
        }
        Ok(())
    }

    fn give_back(&self, mut obj: PooledObject<F::Object>) {
        if self.state.lock().closed {
            self.retire_active(obj, "pool closed");
            return;
        }
        if let Err(e) = self.factory.passivate_object(&mut obj) {
            debug!(id = obj.id(), error = %e, "passivation failed");
            self.retire_active(obj, "passivation failed");
            return;
        }
        if self.config.test_on_return {
            if let Err(e) = self.factory.validate_object(&mut obj) {
                debug!(id = obj.id(), error = %e, "validation on return failed");
                self.retire_active(obj, "failed validation on return");
                return;
            }
            obj.mark_validated();
        }
        obj.mark_returned();

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            self.retire_active(obj, "pool closed");
            return;
        }
        state.active = state.active.saturating_sub(1);
        state.idle.push_back(obj);
        self.available.notify_all();
    }

    /// Destroys an object that was on loan.
    fn retire_active(&self, obj: PooledObject<F::Object>, reason: &str) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            state.destroying += 1;
        }
        self.destroy(obj, reason);
    }

    /// Destroys an object already counted as `destroying`.
    fn destroy(&self, obj: PooledObject<F::Object>, reason: &str) {
        let id = obj.id();
        match self.factory.destroy_object(obj) {
            Ok(()) => debug!(id, reason, "pooled object destroyed"),
            Err(e) => warn!(id, reason, error = %e, "failed to destroy pooled object"),
        }
        let mut state = self.state.lock();
        state.destroying -= 1;
        state.destroyed += 1;
        self.available.notify_all();
    }

    fn evict(&self) -> EvictionReport {
        let now = Instant::now();
        let max_idle = self.config.max_idle_time;
        let mut report = EvictionReport::default();

        let (expired, to_test) = {
            let mut state = self.state.lock();
            if state.closed {
                return report;
            }
            let idle = std::mem::take(&mut state.idle);
            report.examined = idle.len();

            let mut expired = Vec::new();
            let mut to_test = Vec::new();
            for obj in idle {
                if !max_idle.is_zero() && obj.idle_time(now) >= max_idle {
                    expired.push(obj);
                } else if self.config.test_while_idle {
                    to_test.push(obj);
                } else {
                    state.idle.push_back(obj);
                }
            }
            state.destroying += expired.len();
            state.evicting += to_test.len();
            (expired, to_test)
        };

        for obj in expired {
            report.evicted += 1;
            self.destroy(obj, "idle timeout");
        }

        for mut obj in to_test {
            let valid = self.factory.validate_object(&mut obj);
            let mut state = self.state.lock();
            state.evicting -= 1;
            if valid.is_ok() && !state.closed {
                obj.mark_validated();
                // still the oldest idle objects
                state.idle.push_front(obj);
                self.available.notify_all();
                continue;
            }
            state.destroying += 1;
            drop(state);
            if valid.is_err() {
                report.evicted += 1;
            }
            self.destroy(obj, "failed validation while idle");
        }

        let (created, error) = self.ensure_min_idle();
        report.created = created;
        if let Some(e) = error {
            warn!(error = %e, "could not restore minimum idle objects");
        }
        report
    }

    fn ensure_min_idle(&self) -> (usize, Option<CoreError>) {
        let ids: Vec<u64> = {
            let mut state = self.state.lock();
            if state.closed {
                return (0, None);
            }
            let wanted = self.config.min_idle.saturating_sub(state.idle.len());
            let room = self.config.max_total.saturating_sub(state.total());
            let count = wanted.min(room);
            state.creating += count;
            (0..count)
                .map(|_| {
                    let id = state.next_id;
                    state.next_id += 1;
                    id
                })
                .collect()
        };

        let reserved = ids.len();
        let mut created = 0;
        for id in ids {
            let object = match self.factory.make_object() {
                Ok(object) => object,
                Err(e) => {
                    self.state.lock().creating -= reserved - created;
                    self.available.notify_all();
                    return (created, Some(e));
                }
            };
            let obj = PooledObject::new(id, object);
            created += 1;
            debug!(id, "idle object created");

            let mut state = self.state.lock();
            state.creating -= 1;
            state.created += 1;
            if state.closed {
                state.destroying += 1;
                drop(state);
                self.destroy(obj, "pool closed");
            } else {
                state.idle.push_back(obj);
                self.available.notify_all();
            }
        }
        (created, None)
    }

    fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.destroying += idle.len();
            self.available.notify_all();
            idle
        };
        for obj in idle {
            self.destroy(obj, "pool closed");
        }

        let evictor = self.evictor.lock().take();
        if let Some(task) = evictor {
            task.stop();
        }
        debug!("pool closed");
    }
}

impl<F: PooledObjectFactory> Drop for PoolShared<F> {
    fn drop(&mut self) {
        self.close();
    }
}
