#![forbid(unsafe_code)]
//! Daemon-common runtime services for blkmirror.
//!
//! The building blocks the mirroring components share: a one-shot completion
//! latch, the callback work queue, the deferred timer, and the admin socket
//! command registry.

pub mod admin;
pub mod completion;
pub mod timer;
pub mod work_queue;

pub use admin::{AdminCommand, AdminSocket, OutputFormat};
pub use completion::Completion;
pub use timer::DeferredTimer;
pub use work_queue::{Callback, WorkQueue};
