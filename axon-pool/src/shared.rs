use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::pool::{Pool, PoolState};

/// A [`Pool`] that can be shared between threads.
///
/// The original use case for pools is a single-threaded event loop, where
/// exclusive access is already guaranteed by `&mut`. When a pool is shared
/// across threads the per-operation state transitions have to be atomic with
/// respect to one another; `SharedPool` provides that by serializing every
/// operation behind a mutex while keeping the same operation set.
pub struct SharedPool<T, S: PoolState> {
    inner: Mutex<Pool<T, S>>,
}

impl<T, S: PoolState> SharedPool<T, S> {
    pub fn new(pool: Pool<T, S>) -> Self {
        SharedPool {
            inner: Mutex::new(pool),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn state_of(&self, id: usize) -> S {
        self.lock().state_of(id)
    }

    pub fn count(&self, state: S) -> usize {
        self.lock().count(state)
    }

    pub fn touched(&self, id: usize) -> Instant {
        self.lock().touched(id)
    }

    pub fn set_state(&self, id: usize, old: S, new: S) {
        self.lock().set_state(id, old, new)
    }

    pub fn try_set_state(&self, id: usize, new: S) -> Result<S, S> {
        self.lock().try_set_state(id, new)
    }

    pub fn set_oldest_state(&self, from: S, to: S) -> Option<usize> {
        self.lock().set_oldest_state(from, to)
    }

    pub fn touch(&self, id: usize) {
        self.lock().touch(id)
    }

    pub fn expired_head(&self, state: S, now: Instant) -> Option<usize> {
        self.lock().expired_head(state, now)
    }

    pub fn timeout(&self, state: S) -> Option<Duration> {
        self.lock().timeout(state)
    }

    /// Runs `f` with exclusive access to the element.
    pub fn with<R>(&self, id: usize, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.lock().get_mut(id))
    }

    /// Runs `f` with exclusive access to the whole pool, for multi-step
    /// operations that must not interleave with other threads.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut Pool<T, S>) -> R) -> R {
        f(&mut self.lock())
    }

    /// Consumes the wrapper, returning the pool.
    pub fn into_inner(self) -> Pool<T, S> {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pool<T, S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
