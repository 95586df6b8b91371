//! Commit word protocol for the double-buffered region.
//!
//! The writer never signals "write in progress" the way a seqlock does.
//! Instead it only ever fills the slot that is *not* active, and publishes a
//! frame by storing the commit word `(active_index, seq)`:
//!
//! **Writer:**
//! 1. Fill slot `(seq + 1) & 1` (payload, size, crc)
//! 2. Store `active_index` (Relaxed)
//! 3. Store `seq + 1` (Release) → frame becomes discoverable
//!
//! **Reader:**
//! 1. Load `generation`, `seq` (Acquire), then `active_index`
//! 2. If `active_index != seq & 1` a commit is in flight; come back later
//! 3. Copy the slot
//! 4. Reload `generation` and `seq`; if either moved the writer may already be
//!    refilling the slot we copied, so the copy is discarded
//!
//! Step 4 is stricter than it needs to be for one intervening commit, but the
//! writer starts refilling our slot right after that commit, before anything
//! in the header tells us so.

use crate::layout::RegionHeader;
use std::sync::atomic::Ordering;

/// Header state observed by a reader before copying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: u64,
    pub seq: u64,
    pub slot: usize,
}

impl Snapshot {
    /// Identity of the frame this snapshot points at.
    #[inline]
    pub fn key(&self) -> (u64, u64) {
        (self.generation, self.seq)
    }
}

/// Makes frame `seq` (already written into `slot`) visible to readers.
#[inline(always)]
pub fn publish(header: &RegionHeader, seq: u64, slot: usize) {
    header.active_index.store(slot as u8, Ordering::Relaxed);
    header.seq.store(seq, Ordering::Release);
}

/// Resets the commit word for a new writer generation.
///
/// `seq` goes back to 0 so readers see "nothing committed" until the new
/// writer's first frame, and the generation bump makes that frame distinct
/// from whatever the previous writer left behind.
pub fn reset(header: &RegionHeader) -> u64 {
    header.seq.store(0, Ordering::Relaxed);
    header.active_index.store(0, Ordering::Relaxed);
    header.generation.fetch_add(1, Ordering::AcqRel) + 1
}

/// Reads the commit word, or `None` while a commit is half-visible.
#[inline(always)]
pub fn snapshot(header: &RegionHeader) -> Option<Snapshot> {
    let generation = header.generation.load(Ordering::Acquire);
    let seq = header.seq.load(Ordering::Acquire);
    let slot = header.active_index.load(Ordering::Relaxed) as usize;
    if seq != 0 && slot != (seq & 1) as usize {
        return None;
    }
    Some(Snapshot {
        generation,
        seq,
        slot,
    })
}

/// True if no commit or writer restart happened since `snap` was taken.
#[inline(always)]
pub fn still_current(header: &RegionHeader, snap: &Snapshot) -> bool {
    std::sync::atomic::fence(Ordering::Acquire);
    header.seq.load(Ordering::Acquire) == snap.seq
        && header.generation.load(Ordering::Acquire) == snap.generation
}
