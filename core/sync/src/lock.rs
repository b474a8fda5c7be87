//! Single-flight guard for sync cycles.
//!
//! A cycle only runs if it can take the lock immediately; a trigger that
//! finds it held returns without doing anything.

use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking, acquire-if-available lock capability.
pub trait TryLock: Send + Sync {
    /// Lock name, used in logs.
    fn name(&self) -> &str;

    /// Take the lock if it is free. Never waits.
    fn try_acquire(&self) -> bool;

    /// Give the lock back.
    fn release(&self);
}

/// In-process named lock backed by an atomic flag.
///
/// Share one instance (e.g. behind an `Arc`) between everything that may
/// trigger a cycle.
#[derive(Debug)]
pub struct NamedLock {
    name: String,
    held: AtomicBool,
}

impl NamedLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            held: AtomicBool::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl TryLock for NamedLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Lock for hosts without any locking primitive. Always grants.
///
/// With this lock the engine is only correct for a single caller;
/// keeping cycles from overlapping is up to whoever triggers them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl TryLock for NoLock {
    fn name(&self) -> &str {
        "none"
    }

    fn try_acquire(&self) -> bool {
        true
    }

    fn release(&self) {}
}

/// Releases the lock when dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn TryLock,
}

impl<'a> LockGuard<'a> {
    /// Try to take `lock`, returning a guard on success.
    pub fn acquire(lock: &'a dyn TryLock) -> Option<Self> {
        if lock.try_acquire() {
            Some(Self { lock })
        } else {
            None
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_lock_is_exclusive() {
        let lock = NamedLock::new("cycle");
        let guard = LockGuard::acquire(&lock).expect("first acquire");
        assert!(lock.is_held());
        assert!(LockGuard::acquire(&lock).is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(LockGuard::acquire(&lock).is_some());
    }

    #[test]
    fn test_no_lock_always_grants() {
        let lock = NoLock;
        let _a = LockGuard::acquire(&lock).unwrap();
        let _b = LockGuard::acquire(&lock).unwrap();
    }
}
