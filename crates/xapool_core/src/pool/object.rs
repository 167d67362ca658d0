//! Pooled objects and their lifecycle hooks.

use crate::error::CoreResult;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// An object owned by a pool, together with the pool's bookkeeping.
///
/// Not `Clone`: whoever holds a `PooledObject` is its only user. The pool
/// hands it out by value in `borrow` and takes it back by value.
pub struct PooledObject<T> {
    id: u64,
    object: T,
    created_at: Instant,
    last_borrowed: Option<Instant>,
    last_returned: Instant,
    last_validated: Option<Instant>,
    borrow_count: u64,
}

impl<T> PooledObject<T> {
    pub(crate) fn new(id: u64, object: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            object,
            created_at: now,
            last_borrowed: None,
            last_returned: now,
            last_validated: None,
            borrow_count: 0,
        }
    }

    /// Returns the pool-assigned id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns when the object was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns when the object was last lent out.
    #[must_use]
    pub fn last_borrowed(&self) -> Option<Instant> {
        self.last_borrowed
    }

    /// Returns when the object last became idle.
    #[must_use]
    pub fn last_returned(&self) -> Instant {
        self.last_returned
    }

    /// Returns when the object last passed validation.
    #[must_use]
    pub fn last_validated(&self) -> Option<Instant> {
        self.last_validated
    }

    /// Returns how many times the object was lent out.
    #[must_use]
    pub fn borrow_count(&self) -> u64 {
        self.borrow_count
    }

    /// Returns how long the object has been idle at `now`.
    #[must_use]
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_returned)
    }

    /// Returns a reference to the wrapped object.
    #[must_use]
    pub fn get_ref(&self) -> &T {
        &self.object
    }

    /// Returns a mutable reference to the wrapped object.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.object
    }

    /// Unwraps the object, dropping the bookkeeping.
    pub fn into_inner(self) -> T {
        self.object
    }

    pub(crate) fn mark_borrowed(&mut self) {
        self.last_borrowed = Some(Instant::now());
        self.borrow_count += 1;
    }

    pub(crate) fn mark_returned(&mut self) {
        self.last_returned = Instant::now();
    }

    pub(crate) fn mark_validated(&mut self) {
        self.last_validated = Some(Instant::now());
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T> fmt::Debug for PooledObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("id", &self.id)
            .field("borrow_count", &self.borrow_count)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Lifecycle hooks a pool calls on its objects.
///
/// The pool never holds its lock while calling a hook, and every hook
/// receives an object the pool does not currently share with anyone.
pub trait PooledObjectFactory: Send + Sync + 'static {
    /// The pooled object type.
    type Object: Send + 'static;

    /// Creates a new object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be created. The pool releases
    /// the slot it reserved and reports the error to the borrower.
    fn make_object(&self) -> CoreResult<Self::Object>;

    /// Checks that an object is still usable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::ConnectionValidationFailed`] if it is
    /// not. The pool destroys the object.
    fn validate_object(&self, obj: &mut PooledObject<Self::Object>) -> CoreResult<()>;

    /// Prepares an idle object for a borrower.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be lent out; the pool destroys
    /// it and tries another one.
    fn activate_object(&self, obj: &mut PooledObject<Self::Object>) -> CoreResult<()> {
        let _ = obj;
        Ok(())
    }

    /// Clears per-use state before the object becomes idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be reused; the pool destroys it.
    fn passivate_object(&self, obj: &mut PooledObject<Self::Object>) -> CoreResult<()> {
        let _ = obj;
        Ok(())
    }

    /// Destroys an object.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup failed. The pool logs it; the object is
    /// gone either way.
    fn destroy_object(&self, obj: PooledObject<Self::Object>) -> CoreResult<()>;
}
