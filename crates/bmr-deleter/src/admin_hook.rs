#![forbid(unsafe_code)]
//! Admin socket surface for the deletion scheduler.
//!
//! One command is registered for the scheduler's lifetime; it renders the
//! queue status into the caller's buffer. The handler holds only a weak
//! reference to the scheduler core, so a command raced against teardown
//! degrades to empty output instead of keeping the scheduler alive.

use crate::DeleterShared;
use bmr_error::Result;
use bmr_runtime::{AdminCommand, AdminSocket, OutputFormat};
use std::sync::{Arc, Weak};

/// Command name registered on the admin socket.
pub const DELETION_STATUS_COMMAND: &str = "rbd mirror deletion status";

struct StatusCommand {
    deleter: Weak<DeleterShared>,
}

impl AdminCommand for StatusCommand {
    fn call(&self, format: OutputFormat, out: &mut Vec<u8>) -> bool {
        if let Some(deleter) = self.deleter.upgrade() {
            deleter.render_status(format, out);
        }
        true
    }
}

/// Registration handle; unregisters the command on drop.
pub(crate) struct DeletionAdminHook {
    socket: Arc<AdminSocket>,
}

impl DeletionAdminHook {
    pub(crate) fn register(
        socket: &Arc<AdminSocket>,
        deleter: &Arc<DeleterShared>,
    ) -> Result<Self> {
        socket.register_command(
            DELETION_STATUS_COMMAND,
            "get status for image deleter",
            Arc::new(StatusCommand {
                deleter: Arc::downgrade(deleter),
            }),
        )?;
        Ok(Self {
            socket: Arc::clone(socket),
        })
    }
}

impl Drop for DeletionAdminHook {
    fn drop(&mut self) {
        self.socket.unregister_command(DELETION_STATUS_COMMAND);
    }
}
