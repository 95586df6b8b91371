use crate::error::CommandError;
use crate::protocol::{Args, is_reserved};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Application handler for one command. The returned value becomes the reply.
pub type CommandHandler = Arc<dyn Fn(&Args) -> anyhow::Result<Value> + Send + Sync>;

/// Called with the request args when `__shutdown__` arrives.
pub type ShutdownHandler = Arc<dyn Fn(&Args) -> anyhow::Result<Value> + Send + Sync>;

/// Called once with the miss count when heartbeats stop arriving.
pub type MissedHeartbeatHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Handler table for a command server, built before the server starts and
/// read-only afterwards.
///
/// ```ignore
/// let mut registry = CommandRegistry::new();
/// registry.register("lock_widgets", |args| {
///     let locked = args.get("locked").and_then(Value::as_bool).unwrap_or(true);
///     Ok(json!({"status": "success", "locked": locked}))
/// })?;
/// ```
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
    on_shutdown: Option<ShutdownHandler>,
    on_missed_heartbeat: Option<MissedHeartbeatHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Built-in names and names already registered are refused.
    pub fn register<F>(&mut self, cmd: &str, handler: F) -> Result<(), CommandError>
    where
        F: Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        if is_reserved(cmd) {
            return Err(CommandError::ReservedCommand(cmd.to_owned()));
        }
        if self.handlers.contains_key(cmd) {
            return Err(CommandError::DuplicateCommand(cmd.to_owned()));
        }
        self.handlers.insert(cmd.to_owned(), Arc::new(handler));
        Ok(())
    }

    /// Replaces any previous shutdown callback.
    pub fn on_shutdown<F>(&mut self, handler: F)
    where
        F: Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(handler));
    }

    /// Enables the heartbeat monitor. Replaces any previous callback.
    pub fn on_missed_heartbeat<F>(&mut self, handler: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_missed_heartbeat = Some(Arc::new(handler));
    }

    pub fn handler(&self, cmd: &str) -> Option<&CommandHandler> {
        self.handlers.get(cmd)
    }

    pub fn shutdown_handler(&self) -> Option<&ShutdownHandler> {
        self.on_shutdown.as_ref()
    }

    pub fn missed_heartbeat_handler(&self) -> Option<&MissedHeartbeatHandler> {
        self.on_missed_heartbeat.as_ref()
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
