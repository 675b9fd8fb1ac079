//! Phase gate: a settable event that lets a driving flow wait for a
//! completion continuation running on another thread.
//!
//! The gate has two states, unset and set. `signal` moves it to set and
//! stores a payload (usually the phase outcome). Once set it stays set until
//! `reset`, so a late `wait` returns immediately instead of missing the
//! signal. The payload goes to the first waiter to observe the set state.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::{ExchangeError, ResourceViolation};

/// Returned by [`PhaseGate::wait_timeout`] when the gate stayed unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("phase gate wait timed out")]
pub struct Elapsed;

#[derive(Debug)]
struct GateState<T> {
    set: bool,
    payload: Option<T>,
    waiters: usize,
}

/// A single-writer, multi-reader completion signal.
#[derive(Debug)]
pub struct PhaseGate<T> {
    state: Mutex<GateState<T>>,
    cond: Condvar,
}

impl<T> PhaseGate<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                set: false,
                payload: None,
                waiters: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Set the gate and wake all waiters.
    ///
    /// Returns `false` (and drops `payload`) if the gate was already set.
    pub fn signal(&self, payload: T) -> bool {
        let mut state = self.state.lock();
        if state.set {
            return false;
        }
        state.set = true;
        state.payload = Some(payload);
        drop(state);
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Block until the gate is set.
    ///
    /// The first caller to observe the set state receives the payload; every
    /// later call returns `None` without blocking.
    pub fn wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        if !state.set {
            state.waiters += 1;
            while !state.set {
                self.cond.wait(&mut state);
            }
            state.waiters -= 1;
        }
        state.payload.take()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>, Elapsed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if !state.set {
            state.waiters += 1;
            while !state.set {
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.waiters -= 1;
            if !state.set {
                return Err(Elapsed);
            }
        }
        Ok(state.payload.take())
    }

    /// Return the gate to unset, discarding any unclaimed payload.
    ///
    /// Refused while another thread is blocked in `wait`: that waiter could
    /// otherwise miss the signal it is waiting for.
    pub fn reset(&self) -> Result<(), ExchangeError> {
        let mut state = self.state.lock();
        if state.waiters > 0 {
            return Err(ResourceViolation::ResetWhileWaiting(state.waiters).into());
        }
        state.set = false;
        state.payload = None;
        Ok(())
    }
}

impl<T> Default for PhaseGate<T> {
    fn default() -> Self {
        Self::new()
    }
}
