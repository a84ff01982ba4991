#![forbid(unsafe_code)]
//! Callback work queue.
//!
//! Completion callbacks are never fired inline on the thread that produced
//! the result; they are queued here and run on a small pool of dispatch
//! threads. Invocation is therefore never reentrant with the caller of
//! [`WorkQueue::queue`].

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

/// A queued completion callback, fired with a C-style result code.
pub type Callback = Box<dyn FnOnce(i32) + Send + 'static>;

struct WqState {
    jobs: VecDeque<(Callback, i32)>,
    in_flight: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<WqState>,
    cond: Condvar,
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, WqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed pool of dispatch threads draining queued callbacks in FIFO order.
///
/// Dropping the queue stops the pool: already-queued callbacks still run,
/// then the threads are joined.
pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn `threads` dispatch threads named `{name}-{index}`.
    #[must_use]
    pub fn new(name: &str, threads: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WqState {
                jobs: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let workers = (0..threads.max(1))
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || dispatch_loop(&shared))
                    .expect("spawn work queue thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Arrange for `callback(code)` to run on a pool thread.
    ///
    /// Callbacks queued after shutdown began are dropped without running.
    pub fn queue(&self, callback: Callback, code: i32) {
        let depth;
        {
            let mut state = self.shared.lock_state();
            if state.shutdown {
                tracing::warn!(target: "bmr::work_queue", code, "queued_after_shutdown");
                return;
            }
            state.jobs.push_back((callback, code));
            depth = state.jobs.len();
        }
        self.shared.cond.notify_all();
        tracing::trace!(target: "bmr::work_queue", code, depth, "callback_queued");
    }

    /// Block until every queued callback has run.
    pub fn drain(&self) {
        let mut state = self.shared.lock_state();
        while !state.jobs.is_empty() || state.in_flight > 0 {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("threads", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn dispatch_loop(shared: &Shared) {
    loop {
        let (callback, code) = {
            let mut state = shared.lock_state();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.in_flight += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        callback(code);

        {
            let mut state = shared.lock_state();
            state.in_flight -= 1;
        }
        shared.cond.notify_all();
    }
}
