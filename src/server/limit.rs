//! Connection admission limit.
//!
//! A counting semaphore: the admission loop takes a permit before each
//! accept and the permit travels with the connection until its exchange
//! finishes.
//!
//! The admission loop is a plain OS thread and permits are released from
//! worker threads, so this is a blocking `Mutex`/`Condvar` semaphore rather
//! than an async one like `tokio::sync::Semaphore`; there is no async
//! runtime to drive the latter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Inner {
    available: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

/// Bounds the number of connections being served at once.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    inner: Arc<Inner>,
}

impl ConnectionLimit {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                available: Mutex::new(capacity),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - *self.inner.available.lock()
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        let mut available = self.inner.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(self.permit())
    }

    /// Wait up to `timeout` for a free slot.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit> {
        let deadline = Instant::now() + timeout;
        let mut available = self.inner.available.lock();
        while *available == 0 {
            if self
                .inner
                .released
                .wait_until(&mut available, deadline)
                .timed_out()
            {
                if *available == 0 {
                    return None;
                }
                break;
            }
        }
        *available -= 1;
        Some(self.permit())
    }

    fn permit(&self) -> Permit {
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        *self.inner.available.lock() += 1;
        self.inner.released.notify_one();
    }
}
