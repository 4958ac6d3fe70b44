//! The per-workspace reader/writer lock.
//!
//! Readers (non-mutating iteration and binning) share the lock; writers
//! (event insertion, splitting) exclude readers and each other. Guards
//! release on every exit path, including unwinding, so a failing reader
//! can never strand a writer.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// Guard held by readers for the duration of a non-mutating block.
pub type WorkspaceReadGuard<'a> = RwLockReadGuard<'a, ()>;

/// Guard held by writers; excludes all readers and other writers.
pub type WorkspaceWriteGuard<'a> = RwLockWriteGuard<'a, ()>;

/// A handle to the workspace structural lock.
#[derive(Clone)]
pub struct WorkspaceLock {
    lock: Arc<RwLock<()>>,
}

impl WorkspaceLock {
    pub fn new() -> Self {
        WorkspaceLock {
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Acquires a read lock, blocking while a writer holds the lock.
    pub fn read(&self) -> WorkspaceReadGuard<'_> {
        self.lock.read()
    }

    /// Read lock variant safe to take while the same thread already holds
    /// a read guard, even with a writer queued.
    pub fn read_recursive(&self) -> WorkspaceReadGuard<'_> {
        self.lock.read_recursive()
    }

    /// Acquires the write lock, blocking while any reader or writer holds
    /// the lock.
    pub fn write(&self) -> WorkspaceWriteGuard<'_> {
        self.lock.write()
    }
}

impl Default for WorkspaceLock {
    fn default() -> Self {
        Self::new()
    }
}
