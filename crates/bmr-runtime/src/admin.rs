#![forbid(unsafe_code)]
//! Admin socket command registry.
//!
//! The daemon's local introspection surface: components register named
//! commands that render status into a caller-supplied byte buffer, either as
//! plain text or JSON. Registration is process-wide per socket, so a second
//! registration under the same name is rejected rather than silently
//! replaced.

use bmr_error::{MirrorError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Output rendering requested by an admin caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

/// A registered admin command handler.
pub trait AdminCommand: Send + Sync {
    /// Render the command's output into `out`. Returns whether the command
    /// succeeded.
    fn call(&self, format: OutputFormat, out: &mut Vec<u8>) -> bool;
}

struct Registered {
    help: String,
    handler: Arc<dyn AdminCommand>,
}

/// Command-name to handler registry.
#[derive(Default)]
pub struct AdminSocket {
    commands: Mutex<HashMap<String, Registered>>,
}

impl AdminSocket {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::CommandExists`] if the name is taken.
    pub fn register_command(
        &self,
        name: &str,
        help: &str,
        handler: Arc<dyn AdminCommand>,
    ) -> Result<()> {
        let mut commands = self.commands.lock();
        if commands.contains_key(name) {
            return Err(MirrorError::CommandExists(name.to_owned()));
        }
        commands.insert(
            name.to_owned(),
            Registered {
                help: help.to_owned(),
                handler,
            },
        );
        tracing::debug!(target: "bmr::admin", command = name, "command_registered");
        Ok(())
    }

    /// Remove a command. Returns whether it was registered.
    pub fn unregister_command(&self, name: &str) -> bool {
        let removed = self.commands.lock().remove(name).is_some();
        if removed {
            tracing::debug!(target: "bmr::admin", command = name, "command_unregistered");
        }
        removed
    }

    /// Invoke a command, appending its output to `out`.
    ///
    /// Returns `None` for an unknown command, otherwise the handler's
    /// result. The registry lock is not held while the handler runs.
    pub fn execute(&self, name: &str, format: OutputFormat, out: &mut Vec<u8>) -> Option<bool> {
        let handler = {
            let commands = self.commands.lock();
            commands.get(name).map(|r| Arc::clone(&r.handler))
        };
        handler.map(|handler| handler.call(format, out))
    }

    /// Help text for a command, if registered.
    #[must_use]
    pub fn command_help(&self, name: &str) -> Option<String> {
        self.commands.lock().get(name).map(|r| r.help.clone())
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn registered_commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for AdminSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSocket")
            .field("commands", &self.registered_commands())
            .finish_non_exhaustive()
    }
}
