use paddock_wire::WireError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to bind {role} endpoint on {addr}")]
    Bind {
        role: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed broker frame: {0}")]
    MalformedFrame(&'static str),

    #[error("topic of {len} bytes exceeds limit of {max}")]
    TopicTooLong { len: usize, max: usize },

    #[error("failed to start broker thread")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
