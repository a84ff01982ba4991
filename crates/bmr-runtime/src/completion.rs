#![forbid(unsafe_code)]
//! One-shot completion latch.
//!
//! [`Completion`] carries a single result value from the thread that
//! finishes an asynchronous operation to the thread that waits on it. The
//! first `complete` wins; later completions are ignored.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One-shot latch carrying a result of type `T`.
///
/// Intended for a single waiter: `wait` consumes the value.
#[derive(Debug, Default)]
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    fired: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            fired: false,
        }
    }
}

impl<T> Completion<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            cond: Condvar::new(),
        }
    }

    /// Deliver the result, waking the waiter. Only the first call has any
    /// effect.
    pub fn complete(&self, value: T) {
        {
            let mut slot = self.lock_slot();
            if slot.fired {
                return;
            }
            slot.fired = true;
            slot.value = Some(value);
        }
        self.cond.notify_all();
    }

    /// Block until the result is delivered, then take it.
    pub fn wait(&self) -> T {
        let mut slot = self.lock_slot();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the result is delivered or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock_slot();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (new_slot, timeout_result) = self
                .cond
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = new_slot;
            if timeout_result.timed_out() {
                return slot.value.take();
            }
        }
    }

    /// Whether a result has been delivered (it may already be taken).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock_slot().fired
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
