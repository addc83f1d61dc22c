//! Bounded concurrency gate for background I/O
//!
//! [`ConcurrencyLimiter`] caps how many I/O-heavy jobs (ingestion writes,
//! batched snapshot scans, backup pruning) run at once across a node. The
//! cap can be resized at runtime; growing it admits blocked callers
//! immediately instead of waiting for a release.
//!
//! # Example
//!
//! ```ignore
//! let limiter = Arc::new(ConcurrencyLimiter::new(4));
//!
//! std::thread::spawn({
//!     let limiter = Arc::clone(&limiter);
//!     move || {
//!         let _permit = limiter.acquire()?;
//!         // heavy work; the slot is released when the permit drops
//!     }
//! });
//! ```

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    running: usize,
    waiting: usize,
    closed: bool,
}

/// Counting gate protected by a mutex/condvar pair
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
    cond: Condvar,
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `limit` holders (minimum 1)
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                limit: limit.max(1),
                running: 0,
                waiting: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Block until a slot is free, then take it
    ///
    /// Fails with [`Error::Shutdown`] once the limiter has been closed.
    pub fn acquire(&self) -> Result<LimiterPermit<'_>> {
        let mut state = self.state.lock();
        self.wait_for_slot(&mut state)?;
        Ok(LimiterPermit { limiter: self })
    }

    /// Like [`acquire`](Self::acquire), but the permit keeps the limiter alive
    pub fn acquire_owned(self: &Arc<Self>) -> Result<OwnedLimiterPermit> {
        let mut state = self.state.lock();
        self.wait_for_slot(&mut state)?;
        Ok(OwnedLimiterPermit {
            limiter: Arc::clone(self),
        })
    }

    /// Change the cap. Zero is ignored.
    pub fn resize(&self, limit: usize) {
        if limit == 0 {
            return;
        }
        let mut state = self.state.lock();
        let old = state.limit;
        state.limit = limit;
        if limit > old {
            let wake = (limit - old).min(state.waiting);
            for _ in 0..wake {
                self.cond.notify_one();
            }
        }
    }

    /// Reject new acquires and wake every blocked caller with an error
    ///
    /// Permits already handed out stay valid until dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Current cap
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Permits currently held
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Callers currently blocked in `acquire`
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    fn wait_for_slot(&self, state: &mut MutexGuard<'_, LimiterState>) -> Result<()> {
        if state.closed {
            return Err(Error::Shutdown);
        }
        if state.running < state.limit {
            state.running += 1;
            return Ok(());
        }

        state.waiting += 1;
        while !state.closed && state.running >= state.limit {
            self.cond.wait(state);
        }
        state.waiting -= 1;

        if state.closed {
            return Err(Error::Shutdown);
        }
        state.running += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.waiting > 0 {
            self.cond.notify_one();
        }
    }
}

/// Slot held until dropped
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct LimiterPermit<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Slot held until dropped, owning a handle to its limiter
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct OwnedLimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for OwnedLimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
