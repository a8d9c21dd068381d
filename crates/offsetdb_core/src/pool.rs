//! Bounded object pool.
//!
//! Used for read handles and payload codecs. Each pool carries an epoch;
//! [`Pool::expire`] bumps it, and instances borrowed under an older epoch
//! are dropped instead of returned.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PoolState<T> {
    idle: Vec<T>,
    borrowed: usize,
    epoch: u64,
    closed: bool,
}

/// A pool with an optional upper bound on live instances.
#[derive(Debug)]
pub struct Pool<T> {
    name: &'static str,
    max: Option<usize>,
    state: Mutex<PoolState<T>>,
    returned: Condvar,
}

impl<T> Pool<T> {
    /// Creates a pool. With `max` set, borrowing beyond it fails with
    /// [`CoreError::PoolExhausted`].
    pub fn new(name: &'static str, max: Option<usize>) -> Self {
        Self {
            name,
            max,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                borrowed: 0,
                epoch: 0,
                closed: false,
            }),
            returned: Condvar::new(),
        }
    }

    /// Borrows an idle instance or creates one with `create`.
    ///
    /// `create` runs without holding the pool lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexClosed`] after [`Pool::close`],
    /// [`CoreError::PoolExhausted`] when the bound is reached, or the
    /// error of `create`.
    pub fn acquire(&self, create: impl FnOnce() -> CoreResult<T>) -> CoreResult<Pooled<'_, T>> {
        let epoch = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CoreError::IndexClosed);
            }
            if let Some(item) = state.idle.pop() {
                state.borrowed += 1;
                return Ok(Pooled {
                    pool: self,
                    item: Some(item),
                    epoch: state.epoch,
                });
            }
            if let Some(max) = self.max {
                if state.borrowed >= max {
                    return Err(CoreError::PoolExhausted {
                        max,
                        handle: self.name,
                    });
                }
            }
            state.borrowed += 1;
            state.epoch
        };

        match create() {
            Ok(item) => Ok(Pooled {
                pool: self,
                item: Some(item),
                epoch,
            }),
            Err(err) => {
                self.release(None, epoch);
                Err(err)
            }
        }
    }

    fn release(&self, item: Option<T>, epoch: u64) {
        let mut state = self.state.lock();
        state.borrowed = state.borrowed.saturating_sub(1);
        if let Some(item) = item {
            if !state.closed && state.epoch == epoch {
                state.idle.push(item);
            }
        }
        drop(state);
        self.returned.notify_all();
    }

    /// Drops idle instances and makes borrowed ones stale.
    pub fn expire(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.idle.clear();
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Number of instances currently borrowed.
    pub fn borrowed(&self) -> usize {
        self.state.lock().borrowed
    }

    /// Number of idle instances.
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Refuses further borrows, drops idle instances and waits up to
    /// `timeout` for borrowed ones to come back.
    ///
    /// Returns the number of instances still borrowed when the wait ended.
    pub fn close(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.closed = true;
        state.idle.clear();
        while state.borrowed > 0 {
            if self.returned.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.borrowed
    }
}

/// An instance borrowed from a [`Pool`], returned on drop.
#[derive(Debug)]
pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
    epoch: u64,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the item.
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.pool.release(self.item.take(), self.epoch);
    }
}
