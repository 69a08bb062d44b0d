use rusqlite::Connection;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts the background workers and secondary connections owned by a
/// dataset.
///
/// Counters are maintained by RAII guards, so a worker or connection is
/// counted exactly for as long as it is alive.
#[derive(Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<ResourceTrackerInner>,
}

#[derive(Default)]
struct ResourceTrackerInner {
    live_workers: AtomicUsize,
    open_connections: AtomicUsize,
}

/// Point-in-time view of a [`ResourceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSnapshot {
    pub live_workers: usize,
    pub open_secondary_connections: usize,
}

impl ResourceSnapshot {
    pub fn is_idle(&self) -> bool {
        self.live_workers == 0 && self.open_secondary_connections == 0
    }
}

impl ResourceTracker {
    pub fn new() -> ResourceTracker {
        ResourceTracker::default()
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            live_workers: self.inner.live_workers.load(Ordering::Acquire),
            open_secondary_connections: self.inner.open_connections.load(Ordering::Acquire),
        }
    }

    /// Registers a live worker until the guard is dropped.
    ///
    /// The guard is created on the spawning thread and moved into the worker,
    /// so the count is already raised when `spawn` returns.
    pub(crate) fn worker_guard(&self) -> WorkerGuard {
        self.inner.live_workers.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn track_connection(&self, conn: Connection) -> SecondaryConnection {
        self.inner.open_connections.fetch_add(1, Ordering::AcqRel);
        SecondaryConnection {
            conn,
            _guard: ConnectionGuard {
                inner: self.inner.clone(),
            },
        }
    }
}

impl Debug for ResourceTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceTracker({:?})", self.snapshot())
    }
}

pub(crate) struct WorkerGuard {
    inner: Arc<ResourceTrackerInner>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.inner.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ConnectionGuard {
    inner: Arc<ResourceTrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection other than the dataset's primary one.
///
/// Dereferences to [`Connection`]. The connection is closed before the
/// tracker count is released.
pub struct SecondaryConnection {
    conn: Connection,
    _guard: ConnectionGuard,
}

impl Deref for SecondaryConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for SecondaryConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}
