//! Latest-frame-wins broadcast of byte payloads over shared memory.
//!
//! One [`FrameWriter`] publishes into a double-buffered, CRC-protected region;
//! any number of readers ([`RegionReader`] for one-shot polling, [`FrameReader`]
//! for a managed loop) copy out the newest committed frame.
//!
//! # Thread Safety
//! - `FrameWriter` is `Send` but NOT `Sync` (single writer per region).
//! - `RegionReader` / `FrameReader` are `Send`; each keeps its own cursor.

mod commit;
mod config;
mod error;
mod layout;
mod poller;
mod reader;
mod writer;

pub use config::{
    DEFAULT_MAX_MSG_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_REGION_NAME, DEFAULT_RETRY_INTERVAL,
    ShmConfig,
};
pub use error::ShmError;
pub use layout::{HEADER_SIZE, SLOT_PREFIX_SIZE, region_size, slot_offset};
pub use poller::{FrameReader, ReaderHandle, ReaderStats, StopFlag};
pub use reader::{Frame, ReadOutcome, RegionReader};
pub use writer::{FrameWriter, WriteStatus, remove_region};
