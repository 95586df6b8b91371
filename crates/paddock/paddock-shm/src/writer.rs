//! The publishing side of a frame region.

use crate::commit;
use crate::config::ShmConfig;
use crate::error::ShmError;
use crate::layout::{
    REGION_MAGIC, REGION_VERSION, RegionHeader, SLOT_PREFIX_SIZE, SlotHeader, next_slot,
    region_size, slot_offset,
};
use paddock_mmap::{MmapFileMut, region_path};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Result of a [`FrameWriter::write`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The frame is committed under this sequence number.
    Published { seq: u64 },
    /// The writer was closed; the payload was dropped.
    Closed,
}

/// Single writer of a double-buffered frame region.
///
/// Creates the region if it does not exist, otherwise attaches to it and
/// resets its header. That is how a restarted receiver recovers a region left
/// behind by a crashed predecessor without any external cleanup.
///
/// `Send` but not `Sync`: there must only ever be one writer per region.
pub struct FrameWriter {
    /// Owns the mmap lifetime; kept alive but not directly accessed after init.
    _mm: MmapFileMut,
    base: *mut u8,
    path: PathBuf,
    max_msg_size: usize,
    /// Local mirror of the committed sequence number.
    seq: u64,
    generation: u64,
    closed: bool,
}

// SAFETY: the raw pointer targets the mapping owned by `_mm`, which moves with
// the writer. Nothing else in this process writes through it.
unsafe impl Send for FrameWriter {}

impl FrameWriter {
    /// Creates or attaches to the region named in `cfg`.
    ///
    /// # Errors
    /// Invalid config, or the backing file cannot be opened or mapped.
    pub fn create(cfg: &ShmConfig) -> Result<Self, ShmError> {
        cfg.validate()?;
        let path = region_path(&cfg.name);
        let bytes = region_size(cfg.max_msg_size);
        let (mut mm, created) = MmapFileMut::create_or_attach(&path, bytes as u64)?;
        debug_assert!(mm.mapped_len() >= bytes);
        let base = mm.as_mut_ptr();

        // SAFETY: the mapping is at least `bytes` long, which covers the header.
        let header = unsafe { &*(base as *const RegionHeader) };

        // Readers validate magic first, so hide the region while the layout
        // fields change, then expose it again once the commit word is reset.
        header.magic.store(0, Ordering::Release);
        header.version.store(REGION_VERSION, Ordering::Relaxed);
        header
            .max_msg_size
            .store(cfg.max_msg_size as u32, Ordering::Relaxed);
        let generation = commit::reset(header);
        header.magic.store(REGION_MAGIC, Ordering::Release);

        if created {
            info!(
                path = %path.display(),
                max_msg_size = cfg.max_msg_size,
                bytes = mm.mapped_len(),
                "created frame region"
            );
        } else {
            info!(
                path = %path.display(),
                max_msg_size = cfg.max_msg_size,
                bytes = mm.mapped_len(),
                generation,
                "attached to existing frame region"
            );
        }

        Ok(Self {
            _mm: mm,
            base,
            path,
            max_msg_size: cfg.max_msg_size,
            seq: 0,
            generation,
            closed: false,
        })
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        // SAFETY: base points to the RegionHeader initialized in `create`.
        unsafe { &*(self.base as *const RegionHeader) }
    }

    /// Publishes `payload` as the next frame.
    ///
    /// The payload, its size and CRC are fully written into the inactive slot
    /// before the commit word makes it discoverable.
    ///
    /// # Errors
    /// [`ShmError::PayloadTooLarge`] if the payload exceeds `max_msg_size`;
    /// the region is left untouched.
    pub fn write(&mut self, payload: &[u8]) -> Result<WriteStatus, ShmError> {
        if self.closed {
            debug!(len = payload.len(), "dropping write on closed frame writer");
            return Ok(WriteStatus::Closed);
        }
        if payload.len() > self.max_msg_size {
            return Err(ShmError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_msg_size,
            });
        }

        let crc = crc32fast::hash(payload);
        let slot = next_slot(self.seq);
        let offset = slot_offset(self.max_msg_size, slot);

        // SAFETY: `slot_offset + SLOT_PREFIX_SIZE + max_msg_size` lies within
        // the mapping (see `region_size`), and `payload.len() <= max_msg_size`.
        // The slot is not the active one, so no reader treats it as committed.
        unsafe {
            let slot_base = self.base.add(offset);
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                slot_base.add(SLOT_PREFIX_SIZE),
                payload.len(),
            );
            let prefix = &*(slot_base as *const SlotHeader);
            prefix.size.store(payload.len() as u32, Ordering::Relaxed);
            prefix.crc32.store(crc, Ordering::Relaxed);
        }

        self.seq += 1;
        commit::publish(self.header(), self.seq, slot);
        Ok(WriteStatus::Published { seq: self.seq })
    }

    /// Stops publishing. Later writes are dropped, not rejected.
    pub fn close(&mut self) {
        if !self.closed {
            info!(path = %self.path.display(), seq = self.seq, "frame writer closed");
            self.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sequence number of the last committed frame (0 before the first).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    pub fn region_path(&self) -> &Path {
        &self.path
    }
}

/// Deletes the file backing region `name`. Mapped readers keep their mapping
/// and will notice the removal on their next identity check.
pub fn remove_region(name: &str) -> std::io::Result<()> {
    match std::fs::remove_file(region_path(name)) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
