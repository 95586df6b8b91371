//! Shared memory layout of a frame region.
//!
//! One writer publishes into two alternating buffer slots. The header carries
//! the commit word (`seq`, `active_index`) plus enough metadata for a reader to
//! validate the region before trusting any offsets.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       RegionHeader (64B)                         │
//! │  seq (8B atomic) │ active_index (1B atomic) + pad (7B)           │
//! │  magic (8B) │ version (4B) │ max_msg_size (4B)                   │
//! │  generation (8B atomic) │ reserved (24B)                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Slot[0]  size (4B) │ crc32 (4B) │ payload[stride - 8]           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Slot[1]  size (4B) │ crc32 (4B) │ payload[stride - 8]           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Byte Order
//!
//! All integers are host-native and the structs are `#[repr(C)]`. A region is
//! only valid between processes on the same host, which is the only way it can
//! be shared in the first place. The version field guards layout changes.

use std::mem::size_of;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64};

/// ASCII "PADDOCK1".
pub const REGION_MAGIC: u64 = 0x5041_4444_4F43_4B31;

/// Bumped on any incompatible layout change.
pub const REGION_VERSION: u32 = 1;

/// Size of the header block; slots start here.
pub const HEADER_SIZE: usize = 64;

/// Size of the per-slot `{size, crc32}` prefix.
pub const SLOT_PREFIX_SIZE: usize = size_of::<SlotHeader>();

/// Header at offset 0 of every region.
///
/// Every field a live reader may look at is atomic; the writer rewrites the
/// header on attach while readers can still be mapped.
#[repr(C)]
pub struct RegionHeader {
    /// Number of committed frames in this generation. 0 means none yet.
    pub seq: AtomicU64,
    /// Slot holding frame `seq`. Always `seq & 1` once committed.
    pub active_index: AtomicU8,
    _pad: [u8; 7],
    /// Must equal [`REGION_MAGIC`]. Written last during initialization.
    pub magic: AtomicU64,
    pub version: AtomicU32,
    /// Payload capacity of each slot as configured by the current writer.
    pub max_msg_size: AtomicU32,
    /// Incremented every time a writer attaches to the region.
    pub generation: AtomicU64,
    _reserved: [u8; 24],
}

const _: () = assert!(size_of::<RegionHeader>() == HEADER_SIZE);

/// Prefix of each buffer slot; the payload bytes follow it directly.
#[repr(C)]
pub struct SlotHeader {
    pub size: AtomicU32,
    pub crc32: AtomicU32,
}

impl RegionHeader {
    /// Validates the header of a mapping `mapped_len` bytes long.
    ///
    /// Returns the writer's `max_msg_size` when the region is usable.
    pub fn validate(&self, mapped_len: usize) -> Result<usize, &'static str> {
        use std::sync::atomic::Ordering;

        if self.magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err("bad magic");
        }
        if self.version.load(Ordering::Relaxed) != REGION_VERSION {
            return Err("wrong version");
        }
        let max = self.max_msg_size.load(Ordering::Relaxed) as usize;
        if max == 0 {
            return Err("zero max_msg_size");
        }
        if region_size(max) > mapped_len {
            return Err("region shorter than its layout");
        }
        Ok(max)
    }
}

/// Distance between the two slots.
///
/// The payload area is rounded up to 8 bytes so the second slot's prefix stays
/// aligned for atomic access.
#[inline]
pub const fn slot_stride(max_msg_size: usize) -> usize {
    SLOT_PREFIX_SIZE + ((max_msg_size + 7) & !7)
}

/// Offset of slot `index` (0 or 1) from the start of the region.
#[inline]
pub const fn slot_offset(max_msg_size: usize, index: usize) -> usize {
    HEADER_SIZE + index * slot_stride(max_msg_size)
}

/// Total bytes required for a region: `H + 2 * B`.
#[inline]
pub const fn region_size(max_msg_size: usize) -> usize {
    HEADER_SIZE + 2 * slot_stride(max_msg_size)
}

/// The slot a writer must fill next: never the one holding frame `seq`.
#[inline(always)]
pub const fn next_slot(seq: u64) -> usize {
    (seq.wrapping_add(1) & 1) as usize
}
