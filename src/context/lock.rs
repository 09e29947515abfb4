//! Shared-context lock discipline
//!
//! Design: Only contexts created as shared carry a lock; private contexts
//! pay nothing. Locks are per node and are only ever taken in
//! ancestor-to-descendant order, so no cross-context ordering table is needed.
//!
//! Recursive delete threads a `ParentLock` flag down the recursion: a child
//! being deleted while its parent's lock is already held by the caller must
//! not try to take it again. Each lock also records the holding thread so a
//! same-thread re-acquisition is reported instead of deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::ContextNode;
use crate::error::fatal_assert;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Whether the caller already holds the parent's lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentLock {
    Acquire,
    AlreadyHeld,
}

/// Mutual exclusion for one shared context
pub(crate) struct SharedLock {
    mutex: Mutex<()>,
    owner: AtomicU64,
}

impl SharedLock {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            owner: AtomicU64::new(0),
        }
    }

    /// Block until the lock is ours
    pub(crate) fn acquire(&self, name: &str) -> SharedLockGuard<'_> {
        fatal_assert!(
            !self.held_by_current_thread(),
            "self-deadlock: lock on memory context \"{}\" is already held by this thread",
            name
        );

        let guard = self.mutex.lock();
        self.owner.store(thread_token(), Ordering::Release);

        SharedLockGuard { lock: self, _guard: guard }
    }

    /// Take the lock only if that cannot block or self-deadlock
    pub(crate) fn try_acquire(&self) -> Option<SharedLockGuard<'_>> {
        if self.held_by_current_thread() {
            return None;
        }

        let guard = self.mutex.try_lock()?;
        self.owner.store(thread_token(), Ordering::Release);

        Some(SharedLockGuard { lock: self, _guard: guard })
    }

    #[inline]
    pub(crate) fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_token()
    }
}

/// Scoped ownership of a `SharedLock`; released on every exit path
pub(crate) struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        // Cleared before the mutex guard field is dropped
        self.lock.owner.store(0, Ordering::Release);
    }
}

impl ContextNode {
    /// Lock this node if it is shared
    #[inline]
    pub(crate) fn lock(&self) -> Option<SharedLockGuard<'_>> {
        self.lock.as_ref().map(|lock| lock.acquire(&self.name))
    }

    /// Lock this node unless the caller says it already holds the lock
    pub(crate) fn lock_unless_held(&self, held: ParentLock) -> Option<SharedLockGuard<'_>> {
        match held {
            ParentLock::Acquire => self.lock(),
            ParentLock::AlreadyHeld => {
                debug_assert!(
                    self.lock.as_ref().map_or(true, SharedLock::held_by_current_thread),
                    "parent lock flagged as held but not owned by this thread"
                );
                None
            }
        }
    }

    /// Non-blocking variant used on the error-reporting path.
    ///
    /// `None` means the lock is busy; `Some(None)` means the node is private.
    pub(crate) fn try_lock(&self) -> Option<Option<SharedLockGuard<'_>>> {
        match &self.lock {
            Some(lock) => lock.try_acquire().map(Some),
            None => Some(None),
        }
    }
}
