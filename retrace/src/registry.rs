//! Thread registry
//!
//! Process threads participating in the loop register here before their first
//! yield. Each registering thread gets a monotonic [`ThreadSlot`] and a role;
//! the role is immutable afterwards. Exactly one looper is permitted, any
//! number of workers. Entries are write-once, so lookups after registration
//! only ever take the read side of the lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::thread;

use log::debug;
use retrace_common::{ThreadRole, ThreadSlot};

use crate::domain::errors::SchedulerError;
use crate::domain::types::OsTid;

/// What the registry knows about one registered thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub slot: ThreadSlot,
    pub role: ThreadRole,
    pub os_tid: OsTid,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_thread: HashMap<thread::ThreadId, ThreadInfo>,
    looper: Option<ThreadSlot>,
    next_slot: u32,
}

/// Process-wide table of registered threads, keyed by OS thread identity.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    inner: RwLock<RegistryInner>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread under `role`.
    ///
    /// # Errors
    ///
    /// Fails if a looper is already registered, or if this thread has
    /// registered before (roles never change).
    pub fn register(&self, role: ThreadRole) -> Result<ThreadSlot, SchedulerError> {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(existing) = inner.by_thread.get(&thread::current().id()) {
            return Err(SchedulerError::ThreadAlreadyRegistered(existing.role));
        }
        if role == ThreadRole::Looper {
            if let Some(slot) = inner.looper {
                return Err(SchedulerError::LooperTaken(slot));
            }
        }

        let slot = ThreadSlot(inner.next_slot);
        inner.next_slot += 1;
        if role == ThreadRole::Looper {
            inner.looper = Some(slot);
        }

        let info = ThreadInfo { slot, role, os_tid: current_os_tid() };
        inner.by_thread.insert(thread::current().id(), info);
        debug!("registered {} as {role} ({})", info.slot, info.os_tid);
        Ok(slot)
    }

    /// The calling thread's registration, if any.
    #[must_use]
    pub fn current(&self) -> Option<ThreadInfo> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.by_thread.get(&thread::current().id()).copied()
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.by_thread.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(target_os = "linux")]
fn current_os_tid() -> OsTid {
    // SAFETY: gettid has no preconditions and cannot fail.
    #[allow(unsafe_code)]
    OsTid(unsafe { libc::gettid() })
}

#[cfg(not(target_os = "linux"))]
fn current_os_tid() -> OsTid {
    OsTid(-1)
}
