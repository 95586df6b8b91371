//! Read-only view of a frame region.

use crate::commit::{self, Snapshot};
use crate::error::ShmError;
use crate::layout::{HEADER_SIZE, RegionHeader, SLOT_PREFIX_SIZE, SlotHeader, slot_offset};
use paddock_mmap::{MmapFile, region_path};
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering;

/// How many times a copy is retried when the writer commits during it.
const MAX_COPY_ATTEMPTS: usize = 4;

/// A committed frame copied out of shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub generation: u64,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Outcome of a single [`RegionReader::try_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing new since the last frame (or a commit is still landing).
    Unchanged,
    Frame(Frame),
    /// The newest frame failed its checksum. It will not be reported again.
    Corrupt {
        seq: u64,
        expected_crc: u32,
        actual_crc: u32,
    },
}

/// Reader side of a frame region.
///
/// Never writes to shared memory. Each reader tracks the last frame it has
/// seen and only reports a frame once, however often it polls.
pub struct RegionReader {
    mm: MmapFile,
    base: *const u8,
    max_msg_size: usize,
    last_key: Option<(u64, u64)>,
}

// SAFETY: the pointer targets the read-only mapping owned by `mm`.
unsafe impl Send for RegionReader {}

impl RegionReader {
    /// Maps the region named `name` and validates its header.
    ///
    /// # Errors
    /// - the region does not exist yet
    /// - the header is not (yet) a valid region header
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Self::open_path(region_path(name))
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, ShmError> {
        let mm = MmapFile::open_ro(path)?;
        if mm.mapped_len() < HEADER_SIZE {
            return Err(ShmError::InvalidRegion("region shorter than header"));
        }
        let base = mm.as_ptr();
        // SAFETY: the mapping holds at least HEADER_SIZE bytes.
        let header = unsafe { &*(base as *const RegionHeader) };
        let max_msg_size = header
            .validate(mm.mapped_len())
            .map_err(ShmError::InvalidRegion)?;

        Ok(Self {
            mm,
            base,
            max_msg_size,
            last_key: None,
        })
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        // SAFETY: base points to a validated RegionHeader.
        unsafe { &*(self.base as *const RegionHeader) }
    }

    /// Checks that the region still has the layout we mapped.
    fn check_layout(&self) -> Result<(), ShmError> {
        match self.header().validate(self.mm.mapped_len()) {
            Ok(max) if max == self.max_msg_size => Ok(()),
            _ => Err(ShmError::RegionChanged),
        }
    }

    /// Looks for a new committed frame.
    ///
    /// # Errors
    /// [`ShmError::RegionChanged`] when the region no longer matches this
    /// mapping; the caller should drop the reader and reattach.
    pub fn try_read(&mut self) -> Result<ReadOutcome, ShmError> {
        self.check_layout()?;

        for _ in 0..MAX_COPY_ATTEMPTS {
            let Some(snap) = commit::snapshot(self.header()) else {
                return Ok(ReadOutcome::Unchanged);
            };
            if snap.seq == 0 || Some(snap.key()) == self.last_key {
                return Ok(ReadOutcome::Unchanged);
            }

            let (size, crc, payload) = self.copy_slot(&snap);
            if !commit::still_current(self.header(), &snap) {
                // Writer moved on mid-copy; retry against the newer frame.
                std::hint::spin_loop();
                continue;
            }

            self.last_key = Some(snap.key());
            let Some(payload) = payload else {
                return Ok(ReadOutcome::Corrupt {
                    seq: snap.seq,
                    expected_crc: crc,
                    actual_crc: 0,
                });
            };
            let actual = crc32fast::hash(&payload);
            if actual != crc || payload.len() != size {
                return Ok(ReadOutcome::Corrupt {
                    seq: snap.seq,
                    expected_crc: crc,
                    actual_crc: actual,
                });
            }
            return Ok(ReadOutcome::Frame(Frame {
                generation: snap.generation,
                seq: snap.seq,
                payload,
            }));
        }

        // Writer is outpacing us; try again on the next poll.
        Ok(ReadOutcome::Unchanged)
    }

    /// Copies `{size, crc32, payload}` out of the snapshot's slot.
    ///
    /// The payload is `None` when the stored size is out of range.
    fn copy_slot(&self, snap: &Snapshot) -> (usize, u32, Option<Vec<u8>>) {
        let offset = slot_offset(self.max_msg_size, snap.slot);
        // SAFETY: validate() guaranteed the mapping covers both slots.
        unsafe {
            let slot_base = self.base.add(offset);
            let prefix = &*(slot_base as *const SlotHeader);
            let size = prefix.size.load(Ordering::Relaxed) as usize;
            let crc = prefix.crc32.load(Ordering::Relaxed);
            if size > self.max_msg_size {
                return (size, crc, None);
            }
            let mut out = Vec::with_capacity(size);
            ptr::copy_nonoverlapping(slot_base.add(SLOT_PREFIX_SIZE), out.as_mut_ptr(), size);
            out.set_len(size);
            (size, crc, Some(out))
        }
    }

    /// True if the backing file was removed or recreated since we mapped it.
    pub fn is_replaced(&self) -> bool {
        self.mm.is_replaced()
    }

    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    /// `(generation, seq)` of the last frame reported or rejected.
    pub fn last_key(&self) -> Option<(u64, u64)> {
        self.last_key
    }
}
