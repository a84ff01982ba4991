#![forbid(unsafe_code)]
//! Error types for blkmirror.
//!
//! Defines `MirrorError` and a `Result<T>` alias used throughout the
//! workspace. Completion callbacks cross thread and component boundaries
//! with C-style result codes (0 success, negative errno failure), so this
//! crate also owns the errno interop: `to_errno` mappings, the blacklist
//! alias, and strerror-style rendering for status output.

use thiserror::Error;

/// Unified error type for blkmirror operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("admin command already registered: {0}")]
    CommandExists(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("waiter displaced by a newer registration")]
    Stale,

    #[error("client blacklisted by the cluster")]
    Blacklisted,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("shutting down")]
    ShuttingDown,
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errno carried by blacklist failures.
///
/// The cluster wire protocol reuses `ESHUTDOWN` for a client whose
/// credentials have been revoked; no progress is possible until an operator
/// intervenes.
pub const EBLACKLISTED: i32 = libc::ESHUTDOWN;

impl MirrorError {
    /// Convert this error into a POSIX errno for the callback wire.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CommandExists(_) => libc::EEXIST,
            Self::Cancelled => libc::ECANCELED,
            Self::Stale => libc::ESTALE,
            Self::Blacklisted => EBLACKLISTED,
            Self::NotFound(_) => libc::ENOENT,
            Self::ShuttingDown => libc::ESHUTDOWN,
        }
    }
}

/// Render an errno-style result code the way `strerror(3)` would.
///
/// Accepts either sign convention: `strerror(-2)` and `strerror(2)` both
/// describe `ENOENT`.
#[must_use]
pub fn strerror(code: i32) -> String {
    std::io::Error::from_raw_os_error(code.abs()).to_string()
}
