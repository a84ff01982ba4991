#![forbid(unsafe_code)]
//! E2E tests for the image deletion scheduler.
//!
//! Scenarios covered:
//! 1. Simple success: a scheduled deletion completes and its waiter hears 0.
//! 2. Idempotent schedule: re-scheduling only raises `ignore_orphaned`.
//! 3. Displaced waiter: a newer waiter displaces the old one with `-ESTALE`.
//! 4. Retry-immediate: the request is requeued at the front and the worker
//!    pauses instead of spinning.
//! 5. Deferred retry: a transient failure parks in the failed queue until
//!    the timer migrates it back.
//! 6. Blacklist: terminal regardless of classification; no retry, no timer.
//!
//! Every test drives the real worker thread against a manual pipeline mock:
//! the mock captures each removal attempt and the test completes each latch
//! explicitly, which makes the interleavings deterministic.

use bmr_deleter::remove::{
    RemoveCompletionRef, RemoveErrorClass, RemoveOutcome, RemovePipeline, RemoveRequest,
};
use bmr_deleter::{ImageDeleter, ImageDeleterConfig, DELETION_STATUS_COMMAND};
use bmr_error::{MirrorError, EBLACKLISTED};
use bmr_runtime::{AdminSocket, DeferredTimer, OutputFormat, WorkQueue};
use bmr_types::{GlobalImageId, IoCtxRef, PoolId, PoolIoCtx};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Manual pipeline mock
// ---------------------------------------------------------------------------

struct PendingRemove {
    request: RemoveRequest,
    on_finish: RemoveCompletionRef,
}

#[derive(Default)]
struct ManualPipeline {
    pending: Mutex<VecDeque<PendingRemove>>,
    cond: Condvar,
    attempts: AtomicUsize,
}

impl ManualPipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the worker to submit the next removal attempt.
    fn next_call(&self, timeout: Duration) -> Option<PendingRemove> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(call) = pending.pop_front() {
                return Some(call);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(pending, remaining).unwrap();
            pending = guard;
            if result.timed_out() {
                return pending.pop_front();
            }
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

impl RemovePipeline for ManualPipeline {
    fn remove(
        &self,
        request: RemoveRequest,
        _work_queue: &Arc<WorkQueue>,
        on_finish: RemoveCompletionRef,
    ) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        self.pending
            .lock()
            .unwrap()
            .push_back(PendingRemove { request, on_finish });
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    timer: Arc<DeferredTimer>,
    pipeline: Arc<ManualPipeline>,
    admin: Arc<AdminSocket>,
    deleter: ImageDeleter,
}

fn harness_with_config(config: ImageDeleterConfig) -> Harness {
    let work_queue = Arc::new(WorkQueue::new("bmr-work", 2));
    let timer = Arc::new(DeferredTimer::new());
    let pipeline = ManualPipeline::new();
    let admin = Arc::new(AdminSocket::new());
    let deleter = ImageDeleter::new(
        work_queue,
        Arc::clone(&timer),
        Arc::clone(&pipeline) as Arc<dyn RemovePipeline>,
        Some(&admin),
        config,
    )
    .expect("spawn deleter");
    Harness {
        timer,
        pipeline,
        admin,
        deleter,
    }
}

fn harness() -> Harness {
    harness_with_config(ImageDeleterConfig::default())
}

fn io_ctx(pool: i64) -> IoCtxRef {
    Arc::new(PoolIoCtx::new(PoolId(pool), format!("pool{pool}")))
}

fn gid(id: &str) -> GlobalImageId {
    GlobalImageId::from(id)
}

fn waiter(
    deleter: &ImageDeleter,
    pool: i64,
    image: &str,
    notify_on_failed_retry: bool,
) -> mpsc::Receiver<i32> {
    let (tx, rx) = mpsc::channel();
    deleter.wait_for_scheduled_deletion(
        PoolId(pool),
        &gid(image),
        Box::new(move |r| {
            let _ = tx.send(r);
        }),
        notify_on_failed_retry,
    );
    rx
}

fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting: {description}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: simple success
// ---------------------------------------------------------------------------

#[test]
fn simple_success_completes_the_waiter() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);

    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    assert_eq!(call.request.global_image_id, gid("a"));
    assert_eq!(call.request.local_io_ctx.pool_id(), PoolId(1));
    assert!(!call.request.ignore_orphaned);

    let rx = waiter(&h.deleter, 1, "a", false);
    call.on_finish.complete(RemoveOutcome::Removed);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(0));

    assert!(h.deleter.delete_queue_items().is_empty());
    assert!(h.deleter.failed_queue_items().is_empty());
    assert_eq!(h.pipeline.attempts(), 1);

    // A waiter attached after completion observes success immediately.
    let late = waiter(&h.deleter, 1, "a", false);
    assert_eq!(late.recv_timeout(RECV_TIMEOUT), Ok(0));
}

#[test]
fn waiting_on_an_unknown_image_completes_immediately() {
    let h = harness();
    let rx = waiter(&h.deleter, 1, "ghost", false);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(0));
    assert_eq!(h.pipeline.attempts(), 0);
}

#[test]
fn waiter_callbacks_fire_on_the_work_queue() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let (tx, rx) = mpsc::channel();
    h.deleter.wait_for_scheduled_deletion(
        PoolId(1),
        &gid("a"),
        Box::new(move |r| {
            let thread = std::thread::current().name().map(str::to_owned);
            let _ = tx.send((r, thread));
        }),
        false,
    );
    call.on_finish.complete(RemoveOutcome::Removed);

    let (r, thread) = rx.recv_timeout(RECV_TIMEOUT).expect("callback fired");
    assert_eq!(r, 0);
    assert!(
        thread.clone().unwrap_or_default().starts_with("bmr-work"),
        "callback ran on {thread:?}"
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: idempotent schedule
// ---------------------------------------------------------------------------

#[test]
fn rescheduling_raises_ignore_orphaned_without_requeueing() {
    let h = harness();
    // Park the worker on an unrelated image so "a" stays pending.
    h.deleter.schedule_image_delete(io_ctx(9), &gid("blocker"), false);
    let blocker = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), true);
    assert_eq!(h.deleter.delete_queue_items(), vec![gid("a")]);

    blocker.on_finish.complete(RemoveOutcome::Removed);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    assert_eq!(call.request.global_image_id, gid("a"));
    assert!(call.request.ignore_orphaned);
    call.on_finish.complete(RemoveOutcome::Removed);
}

// ---------------------------------------------------------------------------
// Scenario 3: displaced waiter
// ---------------------------------------------------------------------------

#[test]
fn a_newer_waiter_displaces_the_old_one_with_stale() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let rx1 = waiter(&h.deleter, 1, "a", false);
    let rx2 = waiter(&h.deleter, 1, "a", false);
    assert_eq!(rx1.recv_timeout(RECV_TIMEOUT), Ok(-libc::ESTALE));

    call.on_finish.complete(RemoveOutcome::Removed);
    assert_eq!(rx2.recv_timeout(RECV_TIMEOUT), Ok(0));
    // The displaced waiter hears nothing further.
    assert!(rx1.recv_timeout(Duration::from_millis(100)).is_err());
}

// ---------------------------------------------------------------------------
// Scenario 4: retry-immediately
// ---------------------------------------------------------------------------

#[test]
fn retry_immediately_requeues_at_the_front_and_pauses() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let first = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let rx1 = waiter(&h.deleter, 1, "a", false);
    first.on_finish.complete(RemoveOutcome::Failed {
        code: -libc::EIO,
        class: RemoveErrorClass::RetryImmediately,
    });

    // The interim failure is reported to the waiter...
    assert_eq!(rx1.recv_timeout(RECV_TIMEOUT), Ok(-libc::EIO));
    // ...and with nothing else pending the worker holds off instead of
    // spinning on the same failure.
    assert!(h.pipeline.next_call(Duration::from_millis(100)).is_none());
    assert_eq!(h.deleter.delete_queue_items(), vec![gid("a")]);

    // Another scheduling event wakes the worker; the requeued request is
    // still served first.
    h.deleter.schedule_image_delete(io_ctx(1), &gid("b"), false);
    let second = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    assert_eq!(second.request.global_image_id, gid("a"));

    let rx2 = waiter(&h.deleter, 1, "a", false);
    second.on_finish.complete(RemoveOutcome::Removed);
    assert_eq!(rx2.recv_timeout(RECV_TIMEOUT), Ok(0));

    let third = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    assert_eq!(third.request.global_image_id, gid("b"));
    third.on_finish.complete(RemoveOutcome::Removed);
}

// ---------------------------------------------------------------------------
// Scenario 5: deferred retry
// ---------------------------------------------------------------------------

#[test]
fn a_transient_failure_parks_until_the_timer_migrates_it() {
    let h = harness_with_config(ImageDeleterConfig {
        delete_retry_interval: 0.05,
    });
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let first = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let rx1 = waiter(&h.deleter, 1, "a", true);
    first.on_finish.complete(RemoveOutcome::Failed {
        code: -libc::ENOENT,
        class: RemoveErrorClass::Other,
    });

    // notify_on_failed_retry: the waiter hears the interim failure and is
    // detached.
    assert_eq!(rx1.recv_timeout(RECV_TIMEOUT), Ok(-libc::ENOENT));
    assert_eq!(
        h.deleter.failed_queue_items(),
        vec![(gid("a"), -libc::ENOENT)]
    );

    // The timer migrates the request back and the worker retries it.
    let second = h
        .pipeline
        .next_call(RECV_TIMEOUT)
        .expect("timer-driven attempt");
    assert_eq!(second.request.global_image_id, gid("a"));
    assert!(h.deleter.failed_queue_items().is_empty());

    let rx2 = waiter(&h.deleter, 1, "a", false);
    second.on_finish.complete(RemoveOutcome::Removed);
    assert_eq!(rx2.recv_timeout(RECV_TIMEOUT), Ok(0));
}

#[test]
fn repeated_failures_surface_retry_counts_in_status() {
    let h = harness_with_config(ImageDeleterConfig {
        delete_retry_interval: 0.05,
    });
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);

    for _ in 0..2 {
        let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
        call.on_finish.complete(RemoveOutcome::Failed {
            code: -libc::EIO,
            class: RemoveErrorClass::Other,
        });
    }

    // Parked for the second time; the first migration bumped the count.
    wait_until("second parking observed", || {
        !h.deleter.failed_queue_items().is_empty()
    });
    let status = h.deleter.status();
    assert_eq!(status.failed_deletes_queue.len(), 1);
    assert_eq!(status.failed_deletes_queue[0].retries, Some(1));
    assert!(status.failed_deletes_queue[0]
        .error_code
        .as_deref()
        .is_some_and(|msg| msg.contains("os error 5")));

    let third = h
        .pipeline
        .next_call(RECV_TIMEOUT)
        .expect("timer-driven attempt");
    third.on_finish.complete(RemoveOutcome::Removed);
    wait_until("queues drained", || {
        h.deleter.failed_queue_items().is_empty() && h.deleter.delete_queue_items().is_empty()
    });
}

#[test]
fn runtime_interval_change_applies_to_the_next_arming() {
    let h = harness(); // 30s default would stall the test if it applied
    h.deleter.set_failed_timer_interval(0.02);

    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let first = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    first.on_finish.complete(RemoveOutcome::Failed {
        code: -libc::EIO,
        class: RemoveErrorClass::Other,
    });

    let second = h
        .pipeline
        .next_call(RECV_TIMEOUT)
        .expect("timer-driven attempt");
    second.on_finish.complete(RemoveOutcome::Removed);
}

#[test]
fn one_timer_covers_failures_that_accumulate_before_it_fires() {
    let h = harness_with_config(ImageDeleterConfig {
        delete_retry_interval: 3600.0,
    });
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    h.deleter.schedule_image_delete(io_ctx(1), &gid("b"), false);

    for _ in 0..2 {
        let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
        call.on_finish.complete(RemoveOutcome::Failed {
            code: -libc::EIO,
            class: RemoveErrorClass::Other,
        });
    }

    wait_until("both parked", || h.deleter.failed_queue_items().len() == 2);
    assert_eq!(h.timer.pending_events(), 1);
}

// ---------------------------------------------------------------------------
// Scenario 6: blacklist
// ---------------------------------------------------------------------------

#[test]
fn a_blacklisted_client_fails_terminally_with_no_retry() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let rx = waiter(&h.deleter, 1, "a", false);
    call.on_finish.complete(RemoveOutcome::Failed {
        code: -EBLACKLISTED,
        class: RemoveErrorClass::Other,
    });

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(-EBLACKLISTED));
    assert!(h.deleter.failed_queue_items().is_empty());
    assert_eq!(h.timer.pending_events(), 0);
    assert!(h.pipeline.next_call(Duration::from_millis(100)).is_none());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn a_cancelled_waiter_hears_nothing_further() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    let rx = waiter(&h.deleter, 1, "a", false);
    h.deleter.cancel_waiter(PoolId(1), &gid("a"));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT), Ok(-libc::ECANCELED));

    // The attempt itself was not aborted; its completion is silent.
    call.on_finish.complete(RemoveOutcome::Removed);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    wait_until("request completed", || {
        h.deleter.delete_queue_items().is_empty()
    });
}

#[test]
fn cancelling_without_a_waiter_is_a_no_op() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");

    h.deleter.cancel_waiter(PoolId(1), &gid("a"));
    h.deleter.cancel_waiter(PoolId(1), &gid("never-scheduled"));
    call.on_finish.complete(RemoveOutcome::Removed);
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

#[test]
fn the_status_command_renders_both_queues() {
    let h = harness();
    // Hold the worker on "active" so "queued" stays pending.
    h.deleter.schedule_image_delete(io_ctx(1), &gid("active"), false);
    let call = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    h.deleter.schedule_image_delete(io_ctx(1), &gid("queued"), false);

    let mut out = Vec::new();
    assert_eq!(
        h.admin
            .execute(DELETION_STATUS_COMMAND, OutputFormat::Json, &mut out),
        Some(true)
    );
    let status: serde_json::Value = serde_json::from_slice(&out).expect("json status");
    assert_eq!(status["delete_images_queue"][0]["global_image_id"], "queued");
    assert_eq!(
        status["failed_deletes_queue"].as_array().map(Vec::len),
        Some(0)
    );

    let mut plain = Vec::new();
    assert_eq!(
        h.admin
            .execute(DELETION_STATUS_COMMAND, OutputFormat::Plain, &mut plain),
        Some(true)
    );
    assert_eq!(
        String::from_utf8(plain).expect("utf8"),
        "[local_pool_id=1, global_image_id=queued]\n"
    );

    call.on_finish.complete(RemoveOutcome::Removed);
    let second = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    second.on_finish.complete(RemoveOutcome::Removed);
}

#[test]
fn status_registration_is_exclusive_until_teardown() {
    let h = harness();

    let work_queue = Arc::new(WorkQueue::new("bmr-work-2", 1));
    let timer = Arc::new(DeferredTimer::new());
    let pipeline = ManualPipeline::new();
    let second = ImageDeleter::new(
        work_queue,
        timer,
        pipeline as Arc<dyn RemovePipeline>,
        Some(&h.admin),
        ImageDeleterConfig::default(),
    );
    assert!(matches!(second, Err(MirrorError::CommandExists(_))));

    drop(h.deleter);
    let mut out = Vec::new();
    assert_eq!(
        h.admin
            .execute(DELETION_STATUS_COMMAND, OutputFormat::Plain, &mut out),
        None
    );
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn teardown_awaits_the_inflight_attempt_and_drops_the_rest() {
    let h = harness();
    h.deleter.schedule_image_delete(io_ctx(1), &gid("a"), false);
    h.deleter.schedule_image_delete(io_ctx(1), &gid("b"), false);
    let inflight = h.pipeline.next_call(RECV_TIMEOUT).expect("removal attempt");
    let rx_b = waiter(&h.deleter, 1, "b", false);

    let finisher = std::thread::spawn(move || {
        // Give teardown time to stop admission before the attempt resolves.
        std::thread::sleep(Duration::from_millis(100));
        inflight.on_finish.complete(RemoveOutcome::Removed);
    });
    drop(h.deleter);
    finisher.join().expect("no panic");

    // "b" was never attempted, and its waiter was dropped silently.
    assert_eq!(h.pipeline.attempts(), 1);
    assert!(rx_b.recv_timeout(Duration::from_millis(100)).is_err());
}
