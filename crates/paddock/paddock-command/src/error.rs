use paddock_wire::WireError;
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("'{0}' is a built-in command and cannot be registered")]
    ReservedCommand(String),

    #[error("a handler is already registered for command '{0}'")]
    DuplicateCommand(String),

    #[error("failed to bind command server on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed reply")]
    MalformedReply(#[source] serde_json::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
