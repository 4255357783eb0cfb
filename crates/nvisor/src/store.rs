//! Single-writer state store
//!
//! Holds the one `SystemState` behind a lock and applies mutations
//! all-or-nothing: a mutation runs against a scratch copy and is
//! committed only when it returns `Ok`, so a failed operation can never
//! leave a partially-applied state behind.
//!
//! The lock is never held across backend calls; callers snapshot what
//! they need, release, and re-enter for the follow-up mutation.

use nvisor_core::SystemState;
use spin::Mutex;

/// The nucleus state store.
pub struct StateStore {
    inner: Mutex<SystemState>,
}

impl StateStore {
    /// Create a store holding an empty system state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SystemState::new()),
        }
    }

    /// Run a read-only closure against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&SystemState) -> R) -> R {
        let guard = self.inner.lock();
        f(&guard)
    }

    /// Apply a mutation atomically.
    ///
    /// The closure runs against a scratch copy; the copy replaces the
    /// live state only on `Ok`. On `Err` the live state is untouched,
    /// including any partial changes the closure made before failing.
    pub fn mutate<R, E>(&self, f: impl FnOnce(&mut SystemState) -> Result<R, E>) -> Result<R, E> {
        let mut guard = self.inner.lock();
        let mut scratch = guard.clone();
        let result = f(&mut scratch)?;
        *guard = scratch;
        Ok(result)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
