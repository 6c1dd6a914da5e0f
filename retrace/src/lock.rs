//! Reentrant core lock
//!
//! A single logical lock protects all scheduler state, and — the load-bearing
//! part — stays held across an entire callback execution: the façade acquires
//! it at `BEFORE_EXEC_CB` and releases it at `AFTER_EXEC_CB`, so at most one
//! callback runs at a time across every registered thread.
//!
//! The logical lock is an owner + depth counter over a std `Mutex`+`Condvar`.
//! While a thread holds the logical lock, the OS mutex itself is free; it is
//! only pinned for the short critical sections that actually touch state.
//! That is what allows "held across the callback" without parking the OS
//! mutex for the callback's whole duration, and it gives us the owner
//! identity a library reentrant mutex would hide (the shutdown path asks
//! "is the current thread the one inside a callback?").

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug)]
struct LockInner<T> {
    owner: Option<ThreadId>,
    depth: u32,
    state: T,
}

/// Owner-tracked reentrant lock around the scheduler state `T`.
#[derive(Debug)]
pub struct CoreLock<T> {
    inner: Mutex<LockInner<T>>,
    cv: Condvar,
}

impl<T> CoreLock<T> {
    pub fn new(state: T) -> Self {
        CoreLock {
            inner: Mutex::new(LockInner { owner: None, depth: 0, state }),
            cv: Condvar::new(),
        }
    }

    fn pin(&self) -> MutexGuard<'_, LockInner<T>> {
        // A callback that panicked mid-yield must not wedge every other
        // thread; the panic itself still propagates to the caller.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the logical lock and keep holding it after return. Reentrant:
    /// the owning thread may acquire again, increasing the depth.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut inner = self.pin();
        while inner.owner.is_some_and(|owner| owner != me) {
            inner = self.cv.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        inner.owner = Some(me);
        inner.depth += 1;
    }

    /// Release one level of the logical lock.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not the owner.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut inner = self.pin();
        assert_eq!(inner.owner, Some(me), "core lock released by non-owner thread");
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.owner = None;
            drop(inner);
            self.cv.notify_all();
        }
    }

    /// Access the state. The calling thread must hold the logical lock.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not the owner.
    pub fn with_held<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let me = thread::current().id();
        let mut inner = self.pin();
        assert_eq!(inner.owner, Some(me), "core lock state accessed by non-owner thread");
        f(&mut inner.state)
    }

    /// Acquire, run `f` on the state, release. Releases on unwind so a
    /// panicking closure leaves the lock usable.
    pub fn enter<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.acquire();
        let _release = ReleaseOnDrop(self);
        self.with_held(f)
    }

    /// True when the calling thread holds the logical lock.
    #[must_use]
    pub fn held_by_current(&self) -> bool {
        self.pin().owner == Some(thread::current().id())
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.pin().depth
    }
}

struct ReleaseOnDrop<'a, T>(&'a CoreLock<T>);

impl<T> Drop for ReleaseOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.release();
    }
}
