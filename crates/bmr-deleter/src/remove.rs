#![forbid(unsafe_code)]
//! Remove-pipeline contract.
//!
//! The scheduler never touches image data itself; it drives an external
//! removal operation through this seam. A pipeline receives one
//! [`RemoveRequest`] per attempt and must fire the supplied completion latch
//! exactly once, from any thread. Pipelines are free to run their own stages
//! on the shared [`WorkQueue`].

use bmr_runtime::{Completion, WorkQueue};
use bmr_types::{GlobalImageId, IoCtxRef};
use std::sync::Arc;

/// How the scheduler should handle a failed removal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveErrorClass {
    /// Permanent: report to the waiter and drop the request.
    Complete,
    /// Transient at the head of the queue: retry without waiting for the
    /// failed-queue timer.
    RetryImmediately,
    /// Transient: park in the failed queue until the retry timer fires.
    Other,
}

/// Terminal result of one removal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The local image is gone.
    Removed,
    /// The attempt failed; `code` is a negative errno.
    Failed { code: i32, class: RemoveErrorClass },
}

/// One removal attempt handed to the pipeline.
#[derive(Debug, Clone)]
pub struct RemoveRequest {
    /// Pool handle the removal addresses the image through; borrowed for the
    /// duration of the attempt.
    pub local_io_ctx: IoCtxRef,
    pub global_image_id: GlobalImageId,
    /// Treat "no primary found" as success.
    pub ignore_orphaned: bool,
}

/// Shared handle to the latch a pipeline fires on completion.
pub type RemoveCompletionRef = Arc<Completion<RemoveOutcome>>;

/// Asynchronous image removal, external to the scheduler.
pub trait RemovePipeline: Send + Sync {
    /// Begin a removal attempt. `on_finish` must be completed exactly once;
    /// the scheduler's worker blocks on it.
    fn remove(&self, request: RemoveRequest, work_queue: &Arc<WorkQueue>, on_finish: RemoveCompletionRef);
}
