#![forbid(unsafe_code)]
//! Deferred one-shot timer service.
//!
//! Runs supplied closures after a configured delay on a dedicated thread.
//! Events fire in deadline order, with the timer lock released around each
//! callback so events may re-enter the service. Events still pending when
//! the service shuts down are dropped without running.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type TimerEvent = Box<dyn FnOnce() + Send + 'static>;

/// Key ordering: deadline first, insertion sequence as tie-break.
type EventKey = (Instant, u64);

struct TimerState {
    events: BTreeMap<EventKey, TimerEvent>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot timed callback service backed by a single thread.
pub struct DeferredTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DeferredTimer {
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                events: BTreeMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("deferred_timer".to_owned())
                .spawn(move || timer_loop(&shared))
                .expect("spawn deferred timer thread")
        };

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Run `event` once, `delay` from now, on the timer thread.
    pub fn add_event_after<F>(&self, delay: Duration, event: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock_state();
            if state.shutdown {
                tracing::warn!(target: "bmr::timer", "event_after_shutdown");
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.events.insert((Instant::now() + delay, seq), Box::new(event));
        }
        self.shared.cond.notify_all();
        tracing::trace!(
            target: "bmr::timer",
            delay_secs = delay.as_secs_f64(),
            "event_armed"
        );
    }

    /// Number of events waiting to fire.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.shared.lock_state().events.len()
    }
}

impl Default for DeferredTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeferredTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTimer")
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}

impl Drop for DeferredTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(shared: &Shared) {
    let mut state = shared.lock_state();
    loop {
        if state.shutdown {
            return;
        }

        // Fire everything that is due, releasing the lock per event.
        loop {
            let next_deadline = state.events.keys().next().map(|&(deadline, _)| deadline);
            let due = match next_deadline {
                Some(deadline) if deadline <= Instant::now() => state.events.pop_first(),
                _ => None,
            };
            let Some((_, event)) = due else {
                break;
            };
            drop(state);
            tracing::trace!(target: "bmr::timer", "event_fired");
            event();
            state = shared.lock_state();
            if state.shutdown {
                return;
            }
        }

        let next_deadline = state.events.keys().next().map(|&(deadline, _)| deadline);
        state = match next_deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                shared
                    .cond
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}
