use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The payload does not fit in a slot. Nothing was written.
    #[error("payload of {len} bytes exceeds max_msg_size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid shared memory config: {0}")]
    InvalidConfig(String),

    #[error("invalid region: {0}")]
    InvalidRegion(&'static str),

    /// The writer restarted with a different layout or the backing file was
    /// replaced; the current mapping must be dropped.
    #[error("region changed underneath the reader")]
    RegionChanged,

    #[error(transparent)]
    Io(#[from] io::Error),
}
