#![forbid(unsafe_code)]
//! Image deletion scheduler for the blkmirror daemon.
//!
//! When an image is removed upstream, or mirroring is disabled for it, the
//! local replica must be reclaimed. This crate accepts deletion requests
//! keyed by (pool, global image id), deduplicates them into an in-memory
//! queue, and drains them through an external remove pipeline on a single
//! worker thread. Transient failures park in a failed queue that a deferred
//! timer migrates back for retry; callers can attach a completion waiter to
//! any outstanding request and observe live status through the admin
//! socket.
//!
//! # Design
//!
//! One mutex (the delete lock) guards the three positions a request can
//! occupy: the pending deque, the single active slot, and the failed deque.
//! A request lives in exactly one position at a time, and at most one
//! request exists per identity. New requests are pushed at the front of the
//! pending deque and the worker pops from the back, so a fresh request is
//! served after at most the current active operation rather than behind the
//! whole backlog.
//!
//! Completion callbacks installed by waiters are wrappers that re-dispatch
//! through the [`WorkQueue`], so user code never runs under the delete lock
//! or inline on the worker thread.

pub mod remove;

mod admin_hook;

pub use admin_hook::DELETION_STATUS_COMMAND;

use crate::remove::{RemoveErrorClass, RemoveOutcome, RemovePipeline, RemoveRequest};
use bmr_error::{strerror, EBLACKLISTED};
use bmr_runtime::{AdminSocket, Callback, Completion, DeferredTimer, OutputFormat, WorkQueue};
use bmr_types::{GlobalImageId, IoCtxRef, PoolId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables consumed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageDeleterConfig {
    /// Seconds to wait before retrying deletions that failed transiently.
    /// Default: 30.
    pub delete_retry_interval: f64,
}

impl Default for ImageDeleterConfig {
    fn default() -> Self {
        Self {
            delete_retry_interval: 30.0,
        }
    }
}

fn retry_interval(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Delete requests
// ---------------------------------------------------------------------------

/// One outstanding deletion request.
struct DeleteInfo {
    local_pool_id: PoolId,
    global_image_id: GlobalImageId,
    local_io_ctx: IoCtxRef,
    /// Treat "no primary found" as success. Monotone: raised to true, never
    /// lowered.
    ignore_orphaned: bool,
    on_delete: Option<Callback>,
    notify_on_failed_retry: bool,
    /// Last failure observed; meaningful while in the failed queue.
    error_code: i32,
    /// Times this request has been migrated out of the failed queue.
    retries: u32,
}

impl DeleteInfo {
    fn new(local_io_ctx: IoCtxRef, global_image_id: GlobalImageId, ignore_orphaned: bool) -> Self {
        Self {
            local_pool_id: local_io_ctx.pool_id(),
            global_image_id,
            local_io_ctx,
            ignore_orphaned,
            on_delete: None,
            notify_on_failed_retry: false,
            error_code: 0,
            retries: 0,
        }
    }

    fn matches(&self, local_pool_id: PoolId, global_image_id: &GlobalImageId) -> bool {
        self.local_pool_id == local_pool_id && self.global_image_id == *global_image_id
    }

    /// Fire the installed waiter, if any, clearing the slot first: the
    /// waiter contract is single-shot until re-installed.
    ///
    /// Callbacks stored here are executor-dispatch wrappers, so firing one
    /// under the delete lock only enqueues.
    fn notify(&mut self, r: i32) {
        if let Some(on_delete) = self.on_delete.take() {
            tracing::debug!(
                target: "bmr::deleter",
                pool = self.local_pool_id.0,
                image = %self.global_image_id,
                r,
                "notify_waiter"
            );
            on_delete(r);
        }
    }
}

impl fmt::Display for DeleteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[local_pool_id={}, global_image_id={}]",
            self.local_pool_id, self.global_image_id
        )
    }
}

// ---------------------------------------------------------------------------
// Queue state (everything behind the delete lock)
// ---------------------------------------------------------------------------

/// The three positions a request can occupy, plus the retry interval that
/// shares their lock.
struct Queues {
    /// Pending requests: pushed at the front, claimed from the back.
    delete_queue: VecDeque<DeleteInfo>,
    /// Requests parked after a transient failure: pushed at the front,
    /// drained from the back by the retry timer.
    failed_queue: VecDeque<DeleteInfo>,
    /// The request currently driven through the remove pipeline.
    active_delete: Option<DeleteInfo>,
    failed_interval: Duration,
}

impl Queues {
    fn new(failed_interval: Duration) -> Self {
        Self {
            delete_queue: VecDeque::new(),
            failed_queue: VecDeque::new(),
            active_delete: None,
            failed_interval,
        }
    }

    /// Locate a request by identity: active slot first, then pending, then
    /// failed. At most one can match.
    fn find(&mut self, local_pool_id: PoolId, global_image_id: &GlobalImageId) -> Option<&mut DeleteInfo> {
        if self
            .active_delete
            .as_ref()
            .is_some_and(|info| info.matches(local_pool_id, global_image_id))
        {
            return self.active_delete.as_mut();
        }
        if let Some(index) = self
            .delete_queue
            .iter()
            .position(|info| info.matches(local_pool_id, global_image_id))
        {
            return self.delete_queue.get_mut(index);
        }
        if let Some(index) = self
            .failed_queue
            .iter()
            .position(|info| info.matches(local_pool_id, global_image_id))
        {
            return self.failed_queue.get_mut(index);
        }
        None
    }

    /// Admit a request, deduplicating by identity. Returns true when a new
    /// entry was queued and the worker should be signalled.
    fn schedule_entry(
        &mut self,
        local_io_ctx: IoCtxRef,
        global_image_id: GlobalImageId,
        ignore_orphaned: bool,
    ) -> bool {
        let local_pool_id = local_io_ctx.pool_id();
        if let Some(existing) = self.find(local_pool_id, &global_image_id) {
            if ignore_orphaned {
                existing.ignore_orphaned = true;
            }
            return false;
        }
        self.delete_queue
            .push_front(DeleteInfo::new(local_io_ctx, global_image_id, ignore_orphaned));
        true
    }

    /// Claim the oldest pending request into the active slot.
    fn claim_next(&mut self) -> bool {
        debug_assert!(self.active_delete.is_none(), "previous claim not released");
        match self.delete_queue.pop_back() {
            Some(info) => {
                self.active_delete = Some(info);
                true
            }
            None => false,
        }
    }

    /// Drop the active request, firing its waiter with `r`.
    fn complete_active(&mut self, r: i32) {
        let mut info = self.active_delete.take().expect("active delete present");
        info.notify(r);
    }

    /// Return the active request to the front of the pending queue for an
    /// immediate retry, notifying any waiter of the interim failure.
    fn requeue_active(&mut self, code: i32) {
        let mut info = self.active_delete.take().expect("active delete present");
        info.notify(code);
        self.delete_queue.push_front(info);
    }

    /// Park the active request at the front of the failed queue. Returns
    /// whether the failed queue was empty beforehand; the caller arms the
    /// retry timer exactly then.
    fn fail_active(&mut self, code: i32) -> bool {
        let mut info = self.active_delete.take().expect("active delete present");
        if info.notify_on_failed_retry {
            info.notify(code);
        }
        info.error_code = code;
        let was_empty = self.failed_queue.is_empty();
        self.failed_queue.push_front(info);
        was_empty
    }

    /// Migrate every failed request to the back of the pending queue,
    /// bumping its retry count. Returns how many moved.
    fn retry_failed(&mut self) -> usize {
        let moved = self.failed_queue.len();
        while let Some(mut info) = self.failed_queue.pop_back() {
            info.retries += 1;
            self.delete_queue.push_back(info);
        }
        moved
    }

    fn snapshot(&self) -> ImageDeleterStatus {
        ImageDeleterStatus {
            delete_images_queue: self.delete_queue.iter().map(DeleteInfoStatus::queued).collect(),
            failed_deletes_queue: self.failed_queue.iter().map(DeleteInfoStatus::failed).collect(),
        }
    }

    #[cfg(test)]
    fn iter_all(&self) -> impl Iterator<Item = &DeleteInfo> {
        self.active_delete
            .iter()
            .chain(self.delete_queue.iter())
            .chain(self.failed_queue.iter())
    }
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

/// Snapshot of one queued request, as rendered by the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteInfoStatus {
    pub local_pool_id: i64,
    pub global_image_id: String,
    /// Present for failed entries only; strerror-rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl DeleteInfoStatus {
    fn queued(info: &DeleteInfo) -> Self {
        Self {
            local_pool_id: info.local_pool_id.0,
            global_image_id: info.global_image_id.to_string(),
            error_code: None,
            retries: None,
        }
    }

    fn failed(info: &DeleteInfo) -> Self {
        Self {
            local_pool_id: info.local_pool_id.0,
            global_image_id: info.global_image_id.to_string(),
            error_code: Some(strerror(info.error_code)),
            retries: Some(info.retries),
        }
    }
}

/// Two-queue status object returned by the admin command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDeleterStatus {
    pub delete_images_queue: Vec<DeleteInfoStatus>,
    pub failed_deletes_queue: Vec<DeleteInfoStatus>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub(crate) struct DeleterShared {
    queues: Mutex<Queues>,
    cond: Condvar,
    running: AtomicBool,
    work_queue: Arc<WorkQueue>,
    timer: Arc<DeferredTimer>,
    pipeline: Arc<dyn RemovePipeline>,
}

/// Serializes image deletion requests through a single worker thread.
///
/// Dropping the scheduler stops admission, waits for the in-flight pipeline
/// attempt (if any) to finish, and joins the worker. Requests outstanding at
/// teardown are dropped without firing their waiters; consumers that need a
/// terminal notification must [`cancel_waiter`](Self::cancel_waiter) first.
pub struct ImageDeleter {
    shared: Arc<DeleterShared>,
    worker: Option<JoinHandle<()>>,
    admin_hook: Option<admin_hook::DeletionAdminHook>,
}

impl ImageDeleter {
    /// Spawn the scheduler. When `admin_socket` is supplied, the status
    /// command is registered on it for the scheduler's lifetime.
    ///
    /// # Errors
    ///
    /// Fails if the status command is already registered on the socket.
    pub fn new(
        work_queue: Arc<WorkQueue>,
        timer: Arc<DeferredTimer>,
        pipeline: Arc<dyn RemovePipeline>,
        admin_socket: Option<&Arc<AdminSocket>>,
        config: ImageDeleterConfig,
    ) -> bmr_error::Result<Self> {
        let shared = Arc::new(DeleterShared {
            queues: Mutex::new(Queues::new(retry_interval(config.delete_retry_interval))),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            work_queue,
            timer,
            pipeline,
        });

        let admin_hook = match admin_socket {
            Some(socket) => Some(admin_hook::DeletionAdminHook::register(socket, &shared)?),
            None => None,
        };

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("image_deleter".to_owned())
                .spawn(move || shared.run_worker())
                .expect("spawn image_deleter thread")
        };

        Ok(Self {
            shared,
            worker: Some(worker),
            admin_hook,
        })
    }

    /// Request deletion of the local replica of `global_image_id`.
    ///
    /// Idempotent per identity: while a matching request is outstanding,
    /// re-scheduling only raises `ignore_orphaned` and leaves the queue
    /// position and any waiter untouched.
    pub fn schedule_image_delete(
        &self,
        local_io_ctx: IoCtxRef,
        global_image_id: &GlobalImageId,
        ignore_orphaned: bool,
    ) {
        tracing::debug!(
            target: "bmr::deleter",
            pool = local_io_ctx.pool_id().0,
            image = %global_image_id,
            ignore_orphaned,
            "schedule_image_delete"
        );

        let mut queues = self.shared.lock_queues();
        if queues.schedule_entry(local_io_ctx, global_image_id.clone(), ignore_orphaned) {
            drop(queues);
            self.shared.cond.notify_one();
        } else {
            tracing::debug!(
                target: "bmr::deleter",
                image = %global_image_id,
                "already_scheduled"
            );
        }
    }

    /// Attach `on_finish` to the outstanding request for this identity.
    ///
    /// The callback is re-dispatched through the work queue, never fired
    /// inline. If no request is outstanding it completes immediately with 0
    /// (the deletion already finished or was never scheduled). A previously
    /// installed waiter is displaced with `-ESTALE`; at most one waiter is
    /// attached at a time. With `notify_on_failed_retry`, the callback also
    /// fires (and detaches) each time the request parks in the failed queue.
    pub fn wait_for_scheduled_deletion(
        &self,
        local_pool_id: PoolId,
        global_image_id: &GlobalImageId,
        on_finish: Callback,
        notify_on_failed_retry: bool,
    ) {
        let work_queue = Arc::clone(&self.shared.work_queue);
        let wrapped: Callback = Box::new(move |r| work_queue.queue(on_finish, r));

        let mut queues = self.shared.lock_queues();
        let Some(info) = queues.find(local_pool_id, global_image_id) else {
            // Image not scheduled for deletion.
            wrapped(0);
            return;
        };

        tracing::debug!(
            target: "bmr::deleter",
            pool = local_pool_id.0,
            image = %global_image_id,
            notify_on_failed_retry,
            "wait_for_scheduled_deletion"
        );

        if let Some(displaced) = info.on_delete.take() {
            displaced(-libc::ESTALE);
        }
        info.on_delete = Some(wrapped);
        info.notify_on_failed_retry = notify_on_failed_retry;
    }

    /// Detach the installed waiter, if any, firing it with `-ECANCELED`.
    ///
    /// The request itself stays queued; only the waiter attachment is
    /// cancelled. An in-flight removal attempt is not aborted; its
    /// completion will find no waiter and stay silent.
    pub fn cancel_waiter(&self, local_pool_id: PoolId, global_image_id: &GlobalImageId) {
        let mut queues = self.shared.lock_queues();
        if let Some(info) = queues.find(local_pool_id, global_image_id) {
            if let Some(on_delete) = info.on_delete.take() {
                tracing::debug!(
                    target: "bmr::deleter",
                    pool = local_pool_id.0,
                    image = %global_image_id,
                    "cancel_waiter"
                );
                on_delete(-libc::ECANCELED);
            }
        }
    }

    /// Point-in-time snapshot of both queues.
    #[must_use]
    pub fn status(&self) -> ImageDeleterStatus {
        self.shared.lock_queues().snapshot()
    }

    /// Append the queue status to `out`, plain or JSON.
    pub fn print_status(&self, format: OutputFormat, out: &mut Vec<u8>) {
        self.shared.render_status(format, out);
    }

    /// Global image ids currently pending deletion, front to back.
    #[must_use]
    pub fn delete_queue_items(&self) -> Vec<GlobalImageId> {
        let queues = self.shared.lock_queues();
        queues
            .delete_queue
            .iter()
            .map(|info| info.global_image_id.clone())
            .collect()
    }

    /// (global image id, last error code) for every parked failure.
    #[must_use]
    pub fn failed_queue_items(&self) -> Vec<(GlobalImageId, i32)> {
        let queues = self.shared.lock_queues();
        queues
            .failed_queue
            .iter()
            .map(|info| (info.global_image_id.clone(), info.error_code))
            .collect()
    }

    /// Change the failed-queue retry interval. Timers already armed keep
    /// their original deadline.
    pub fn set_failed_timer_interval(&self, interval_secs: f64) {
        self.shared.lock_queues().failed_interval = retry_interval(interval_secs);
    }
}

impl Drop for ImageDeleter {
    fn drop(&mut self) {
        tracing::debug!(target: "bmr::deleter", "shutting_down");
        // Unregister the admin command while the scheduler core is intact.
        self.admin_hook.take();

        self.shared.running.store(false, Ordering::Release);
        {
            let _queues = self.shared.lock_queues();
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for ImageDeleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.shared.lock_queues();
        f.debug_struct("ImageDeleter")
            .field("pending", &queues.delete_queue.len())
            .field("failed", &queues.failed_queue.len())
            .field("active", &queues.active_delete.is_some())
            .finish_non_exhaustive()
    }
}

impl DeleterShared {
    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_worker(self: &Arc<Self>) {
        tracing::debug!(target: "bmr::deleter", "worker_started");
        while self.running.load(Ordering::Acquire) {
            {
                let mut queues = self.lock_queues();
                while queues.delete_queue.is_empty() {
                    tracing::trace!(target: "bmr::deleter", "waiting_for_delete_requests");
                    queues = self
                        .cond
                        .wait(queues)
                        .unwrap_or_else(PoisonError::into_inner);
                    if !self.running.load(Ordering::Acquire) {
                        tracing::debug!(target: "bmr::deleter", "worker_stopped");
                        return;
                    }
                }
                let claimed = queues.claim_next();
                debug_assert!(claimed, "pending queue verified non-empty");
            }

            let move_to_next = self.process_image_delete();
            if !move_to_next {
                if !self.running.load(Ordering::Acquire) {
                    tracing::debug!(target: "bmr::deleter", "worker_stopped");
                    return;
                }

                let queues = self.lock_queues();
                if queues.delete_queue.len() == 1 {
                    // Only the just-requeued request is pending: hold off
                    // until another scheduling event instead of spinning on
                    // the same failure.
                    let _queues = self
                        .cond
                        .wait(queues)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        tracing::debug!(target: "bmr::deleter", "worker_stopped");
    }

    /// Drive one removal attempt for the active request. Returns false when
    /// the worker should pause before claiming again (immediate-retry case).
    fn process_image_delete(self: &Arc<Self>) -> bool {
        let request = {
            let queues = self.lock_queues();
            let info = queues.active_delete.as_ref().expect("active delete claimed");
            tracing::info!(
                target: "bmr::deleter",
                delete_info = %info,
                "processing_delete_request"
            );
            RemoveRequest {
                local_io_ctx: Arc::clone(&info.local_io_ctx),
                global_image_id: info.global_image_id.clone(),
                ignore_orphaned: info.ignore_orphaned,
            }
        };

        let remove_ctx = Arc::new(Completion::new());
        self.pipeline
            .remove(request, &self.work_queue, Arc::clone(&remove_ctx));

        match remove_ctx.wait() {
            RemoveOutcome::Removed => {
                self.complete_active_delete(0);
                true
            }
            RemoveOutcome::Failed {
                code,
                class: RemoveErrorClass::Complete,
            } => {
                self.complete_active_delete(code);
                true
            }
            RemoveOutcome::Failed {
                code,
                class: RemoveErrorClass::RetryImmediately,
            } => {
                tracing::debug!(target: "bmr::deleter", code, "retrying_immediately");
                self.lock_queues().requeue_active(code);
                false
            }
            RemoveOutcome::Failed {
                code,
                class: RemoveErrorClass::Other,
            } => {
                self.enqueue_failed_delete(code);
                true
            }
        }
    }

    fn complete_active_delete(&self, r: i32) {
        tracing::debug!(target: "bmr::deleter", r, "complete_active_delete");
        self.lock_queues().complete_active(r);
    }

    /// Park the active request for a timed retry. A blacklisted client makes
    /// no progress until external intervention, so that code is terminal
    /// regardless of classification.
    fn enqueue_failed_delete(self: &Arc<Self>, error_code: i32) {
        if error_code == -EBLACKLISTED {
            tracing::error!(
                target: "bmr::deleter",
                "blacklisted_while_deleting_local_image"
            );
            self.complete_active_delete(error_code);
            return;
        }

        let (was_empty, interval) = {
            let mut queues = self.lock_queues();
            let was_empty = queues.fail_active(error_code);
            (was_empty, queues.failed_interval)
        };
        if was_empty {
            // Exactly one retry timer is pending at a time; failures that
            // accumulate before it fires join the same retry wave.
            let shared = Arc::downgrade(self);
            self.timer.add_event_after(interval, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.retry_failed_deletions();
                }
            });
        }
    }

    fn retry_failed_deletions(&self) {
        let moved = self.lock_queues().retry_failed();
        tracing::debug!(target: "bmr::deleter", moved, "retry_failed_deletions");
        if moved > 0 {
            self.cond.notify_one();
        }
    }

    pub(crate) fn render_status(&self, format: OutputFormat, out: &mut Vec<u8>) {
        tracing::debug!(target: "bmr::deleter", ?format, "print_status");
        let status = self.lock_queues().snapshot();
        match format {
            OutputFormat::Json => match serde_json::to_vec_pretty(&status) {
                Ok(body) => out.extend_from_slice(&body),
                Err(err) => {
                    tracing::error!(target: "bmr::deleter", error = %err, "status_encode_failed");
                }
            },
            OutputFormat::Plain => {
                for entry in status
                    .delete_images_queue
                    .iter()
                    .chain(&status.failed_deletes_queue)
                {
                    let _ = writeln!(
                        out,
                        "[local_pool_id={}, global_image_id={}]",
                        entry.local_pool_id, entry.global_image_id
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
