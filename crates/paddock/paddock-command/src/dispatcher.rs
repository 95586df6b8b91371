//! The protocol state machine shared by the blocking and async servers.
//!
//! Both servers only move bytes: they receive one request frame, hand it to
//! [`Dispatcher::dispatch`], send back exactly the bytes it returns, and stop
//! when it says so. That keeps the two flavours identical on the wire.

use crate::heartbeat::HeartbeatState;
use crate::protocol::{self, Builtin, Request};
use crate::registry::CommandRegistry;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether the serve loop continues after sending a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
    Terminate,
}

/// A reply ready to send, plus what the loop does afterwards.
#[derive(Debug, Clone)]
pub struct Reply {
    pub body: Value,
    pub control: Control,
}

impl Reply {
    fn cont(body: Value) -> Self {
        Self {
            body,
            control: Control::Continue,
        }
    }

    /// Serialized reply frame.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(&self.body).unwrap_or_else(|_| b"{}".to_vec())
    }
}

pub struct Dispatcher {
    name: String,
    registry: CommandRegistry,
    heartbeat: Arc<HeartbeatState>,
}

impl Dispatcher {
    pub fn new(name: String, registry: CommandRegistry, heartbeat: Arc<HeartbeatState>) -> Self {
        Self {
            name,
            registry,
            heartbeat,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatState> {
        &self.heartbeat
    }

    /// Decodes a raw request frame and dispatches it.
    pub fn dispatch_raw(&self, raw: &[u8]) -> Reply {
        match Request::decode(raw) {
            Ok(req) => self.dispatch(&req),
            Err(e) => {
                warn!(source = %self.name, error = %e, "rejecting malformed request");
                Reply::cont(protocol::invalid_request(&e.to_string(), &self.name))
            }
        }
    }

    /// Produces the one reply owed for `req`. Never panics, never fails.
    pub fn dispatch(&self, req: &Request) -> Reply {
        debug!(source = %self.name, cmd = %req.cmd, "dispatching command");
        if let Some(builtin) = Builtin::parse(&req.cmd) {
            return self.dispatch_builtin(builtin, req);
        }
        let Some(handler) = self.registry.handler(&req.cmd) else {
            warn!(source = %self.name, cmd = %req.cmd, "unknown command");
            return Reply::cont(protocol::unknown_command(&req.cmd, &self.name));
        };
        Reply::cont(self.guarded(&req.cmd, || handler(&req.args)))
    }

    fn dispatch_builtin(&self, builtin: Builtin, req: &Request) -> Reply {
        match builtin {
            Builtin::Ping => Reply::cont(protocol::pong(&self.name)),
            Builtin::Heartbeat => {
                self.heartbeat.beat();
                Reply::cont(protocol::heartbeat_ack(&self.name))
            }
            Builtin::Shutdown => {
                info!(source = %self.name, "shutdown requested");
                let body = match self.registry.shutdown_handler() {
                    Some(on_shutdown) => match self.guarded(&req.cmd, || on_shutdown(&req.args)) {
                        Value::Null => protocol::shutting_down(&self.name),
                        body => body,
                    },
                    None => protocol::shutting_down(&self.name),
                };
                Reply {
                    body,
                    control: Control::Shutdown,
                }
            }
            Builtin::Terminate => {
                info!(source = %self.name, "terminate requested");
                Reply {
                    body: protocol::terminated(&self.name),
                    control: Control::Terminate,
                }
            }
        }
    }

    /// Runs a user callback, turning errors and panics into error replies.
    fn guarded(&self, cmd: &str, f: impl FnOnce() -> anyhow::Result<Value>) -> Value {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(Value::Object(map))) => Value::Object(map),
            Ok(Ok(Value::Null)) => Value::Null,
            Ok(Ok(other)) => serde_json::json!({
                "status": protocol::STATUS_SUCCESS,
                "reply": other,
                "source": self.name,
            }),
            Ok(Err(e)) => {
                warn!(source = %self.name, cmd, error = %e, "command handler failed");
                protocol::handler_error(&format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(source = %self.name, cmd, panic = message, "command handler panicked");
                protocol::handler_error(message)
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "handler panicked"
    }
}
