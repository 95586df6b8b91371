//! Messages exchanged between a peer client and a command server.
//!
//! Request: `{"cmd": "<name>", "args": {...}}`. Reply: any JSON object.
//! Exactly one reply is produced for every request, errors included.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Arguments carried by a command.
pub type Args = Map<String, Value>;

pub const PING: &str = "__ping__";
pub const PONG: &str = "__pong__";
pub const HEARTBEAT: &str = "__heartbeat__";
pub const HEARTBEAT_ACK: &str = "__heartbeat_ack__";
pub const SHUTDOWN: &str = "__shutdown__";
pub const TERMINATE: &str = "__terminate__";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Commands every server answers itself. They cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Ping,
    Heartbeat,
    Shutdown,
    Terminate,
}

impl Builtin {
    pub const ALL: [Builtin; 4] = [
        Builtin::Ping,
        Builtin::Heartbeat,
        Builtin::Shutdown,
        Builtin::Terminate,
    ];

    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            PING => Some(Builtin::Ping),
            HEARTBEAT => Some(Builtin::Heartbeat),
            SHUTDOWN => Some(Builtin::Shutdown),
            TERMINATE => Some(Builtin::Terminate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Ping => PING,
            Builtin::Heartbeat => HEARTBEAT,
            Builtin::Shutdown => SHUTDOWN,
            Builtin::Terminate => TERMINATE,
        }
    }
}

pub fn is_reserved(cmd: &str) -> bool {
    Builtin::parse(cmd).is_some()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub args: Args,
}

impl Request {
    pub fn new(cmd: impl Into<String>, args: Args) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of a String and a string-keyed map always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

pub fn pong(source: &str) -> Value {
    json!({"reply": PONG, "source": source})
}

pub fn heartbeat_ack(source: &str) -> Value {
    json!({"status": STATUS_SUCCESS, "reply": HEARTBEAT_ACK, "source": source})
}

pub fn shutting_down(source: &str) -> Value {
    json!({"status": STATUS_SUCCESS, "message": "shutting down", "source": source})
}

pub fn terminated(source: &str) -> Value {
    json!({"status": STATUS_SUCCESS, "message": "terminated", "source": source})
}

pub fn unknown_command(cmd: &str, source: &str) -> Value {
    json!({"status": STATUS_ERROR, "message": format!("unknown command: {cmd}"), "source": source})
}

pub fn invalid_request(reason: &str, source: &str) -> Value {
    json!({"status": STATUS_ERROR, "message": format!("invalid request: {reason}"), "source": source})
}

pub fn handler_error(message: &str) -> Value {
    json!({"status": STATUS_ERROR, "message": message})
}

/// Client-side failure folded into a reply-shaped value.
pub fn client_error(message: &str) -> Value {
    json!({"error": message})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let mut args = Args::new();
        args.insert("locked".into(), json!(true));
        let raw = Request::new("lock_widgets", args).encode();
        let v: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v, json!({"cmd": "lock_widgets", "args": {"locked": true}}));
    }

    #[test]
    fn args_default_to_empty() {
        let req = Request::decode(br#"{"cmd": "__ping__"}"#).unwrap();
        assert_eq!(req.cmd, PING);
        assert!(req.args.is_empty());
    }

    #[test]
    fn builtins_round_trip_names() {
        for b in Builtin::ALL {
            assert_eq!(Builtin::parse(b.name()), Some(b));
            assert!(is_reserved(b.name()));
        }
        assert!(!is_reserved("ping"));
    }
}
