//! Mutual-exclusion wrappers.
//!
//! The cache and inode layers distinguish two lock *roles*, not two lock
//! *implementations*: a [`Spinlock`] guards a short, non-blocking critical
//! section (a cache slot's metadata, the inode table), while a
//! [`Sleeplock`] guards a critical section that may itself block on I/O
//! (an inode's content, held for the duration of a read or write). Both
//! are thin, identically-shaped wrappers around `std::sync::Mutex`; the
//! distinction is documentation for callers, not different runtime
//! behavior.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// A lock intended for short critical sections that never block on I/O.
pub struct Spinlock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| panic!("{}: lock poisoned: {}", self.name, e))
    }
}

impl<T: fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Spinlock");
        s.field("name", &self.name);
        match self.inner.try_lock() {
            Ok(data) => s.field("data", &*data).finish(),
            Err(_) => s.field("data", &format_args!("<locked>")).finish(),
        }
    }
}

/// A lock intended to be held across blocking I/O (a disk read or write).
pub struct Sleeplock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| panic!("{}: lock poisoned: {}", self.name, e))
    }
}

impl<T: fmt::Debug> fmt::Debug for Sleeplock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Sleeplock");
        s.field("name", &self.name);
        match self.inner.try_lock() {
            Ok(data) => s.field("data", &*data).finish(),
            Err(_) => s.field("data", &format_args!("<locked>")).finish(),
        }
    }
}
