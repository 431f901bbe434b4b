//! Block-layer request model consumed by the cache core.
//!
//! The host framework is out of scope; this module defines the request shape
//! the core maps and completes. A `Bio` covers at most one 4 KiB cache line
//! (the host splits larger transfers), carries an optional FUA flag, and owns
//! a per-request tag slot the core uses to route `end_io` work.

use parking_lot::Mutex;
use std::sync::{Arc, Condvar, Mutex as StdMutex, PoisonError};
use wbc_types::{BLOCK_SECTORS, SECTOR_SIZE, Sector};

/// Request direction / payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioKind {
    Read,
    Write,
    /// Pure barrier: no payload, acknowledged once prior writes are durable.
    Flush,
}

/// Per-request tag set by `map` and dispatched on by `end_io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BioTag {
    #[default]
    None,
    /// Read miss reserved a read-cache cell; payload is copied on completion.
    WillCache { cell: u32 },
    /// Read remapped to the cache device; the owning segment holds an
    /// inflight reference until completion.
    ReadSeg { slot: u64 },
}

#[derive(Debug, Default)]
struct Completion {
    state: StdMutex<Option<i32>>,
    cv: Condvar,
}

/// One block-layer request.
///
/// Shared as `Arc<Bio>`: the core may retain barrier bios past `map` and
/// complete them from the flusher thread.
#[derive(Debug)]
pub struct Bio {
    kind: BioKind,
    sector: Sector,
    len_sectors: u8,
    fua: bool,
    payload: Mutex<Vec<u8>>,
    tag: Mutex<BioTag>,
    completion: Completion,
}

impl Bio {
    fn new(kind: BioKind, sector: Sector, len_sectors: u8, fua: bool, payload: Vec<u8>) -> Arc<Bio> {
        Arc::new(Bio {
            kind,
            sector,
            len_sectors,
            fua,
            payload: Mutex::new(payload),
            tag: Mutex::new(BioTag::None),
            completion: Completion::default(),
        })
    }

    /// Read request for `len_sectors` sectors starting at `sector`.
    ///
    /// # Panics
    ///
    /// Panics if the span leaves the containing 4 KiB line or is empty.
    #[must_use]
    pub fn read(sector: Sector, len_sectors: u8) -> Arc<Bio> {
        assert_valid_span(sector, len_sectors);
        let payload = vec![0_u8; usize::from(len_sectors) * SECTOR_SIZE];
        Bio::new(BioKind::Read, sector, len_sectors, false, payload)
    }

    /// Write request carrying `data` (a whole number of sectors).
    ///
    /// # Panics
    ///
    /// Panics if `data` is not sector-granular or the span leaves the line.
    #[must_use]
    pub fn write(sector: Sector, data: &[u8]) -> Arc<Bio> {
        Bio::write_inner(sector, data, false)
    }

    /// Write request with FUA semantics: acknowledged only once durable.
    #[must_use]
    pub fn write_fua(sector: Sector, data: &[u8]) -> Arc<Bio> {
        Bio::write_inner(sector, data, true)
    }

    fn write_inner(sector: Sector, data: &[u8], fua: bool) -> Arc<Bio> {
        assert!(
            !data.is_empty() && data.len() % SECTOR_SIZE == 0,
            "write payload must be a whole number of sectors, got {} bytes",
            data.len()
        );
        let len_sectors = (data.len() / SECTOR_SIZE) as u8;
        assert_valid_span(sector, len_sectors);
        Bio::new(BioKind::Write, sector, len_sectors, fua, data.to_vec())
    }

    /// Pure-flush barrier request.
    #[must_use]
    pub fn flush() -> Arc<Bio> {
        Bio::new(BioKind::Flush, Sector(0), 0, false, Vec::new())
    }

    #[must_use]
    pub fn kind(&self) -> BioKind {
        self.kind
    }

    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    #[must_use]
    pub fn len_sectors(&self) -> u8 {
        self.len_sectors
    }

    #[must_use]
    pub fn fua(&self) -> bool {
        self.fua
    }

    /// Whether the request covers a full cache line.
    #[must_use]
    pub fn is_fullsize(&self) -> bool {
        self.len_sectors == BLOCK_SECTORS
    }

    /// Offset of the first sector within its cache line.
    #[must_use]
    pub fn block_offset(&self) -> u8 {
        self.sector.block_offset()
    }

    /// Lock the payload for inspection or transfer.
    pub fn payload(&self) -> parking_lot::MutexGuard<'_, Vec<u8>> {
        self.payload.lock()
    }

    pub(crate) fn set_tag(&self, tag: BioTag) {
        *self.tag.lock() = tag;
    }

    pub(crate) fn take_tag(&self) -> BioTag {
        std::mem::take(&mut *self.tag.lock())
    }

    /// Complete the request with `errno` (0 for success).
    ///
    /// # Panics
    ///
    /// Panics on double completion; each request is completed exactly once.
    pub fn complete(&self, errno: i32) {
        let mut state = self
            .completion
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert!(state.is_none(), "bio completed twice");
        *state = Some(errno);
        drop(state);
        self.completion.cv.notify_all();
    }

    /// Block until the request completes; returns the errno (0 = success).
    #[must_use]
    pub fn wait(&self) -> i32 {
        let mut state = self
            .completion
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(errno) = *state {
                return errno;
            }
            state = self
                .completion
                .cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Completion result if already available.
    #[must_use]
    pub fn try_result(&self) -> Option<i32> {
        *self
            .completion
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn assert_valid_span(sector: Sector, len_sectors: u8) {
    assert!(
        len_sectors >= 1 && sector.block_offset() + len_sectors <= BLOCK_SECTORS,
        "bio span leaves its cache line: sector={sector} len={len_sectors}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_bio_shape() {
        let bio = Bio::write(Sector(16), &[0xAA; 4096]);
        assert_eq!(bio.kind(), BioKind::Write);
        assert!(bio.is_fullsize());
        assert_eq!(bio.block_offset(), 0);
        assert!(!bio.fua());
        assert_eq!(bio.payload().len(), 4096);
    }

    #[test]
    fn partial_write_offsets() {
        let bio = Bio::write(Sector(21), &[0x11; 1024]);
        assert_eq!(bio.len_sectors(), 2);
        assert_eq!(bio.block_offset(), 5);
        assert!(!bio.is_fullsize());
    }

    #[test]
    #[should_panic(expected = "bio span leaves its cache line")]
    fn bio_must_stay_in_one_line() {
        let _ = Bio::write(Sector(7), &[0_u8; 1024]);
    }

    #[test]
    fn flush_bio_has_no_payload() {
        let bio = Bio::flush();
        assert_eq!(bio.kind(), BioKind::Flush);
        assert_eq!(bio.len_sectors(), 0);
        assert!(bio.payload().is_empty());
    }

    #[test]
    fn completion_wakes_waiter() {
        let bio = Bio::read(Sector(0), 8);
        assert_eq!(bio.try_result(), None);

        let waiter = Arc::clone(&bio);
        let handle = std::thread::spawn(move || waiter.wait());
        bio.complete(0);
        assert_eq!(handle.join().expect("no panic"), 0);
        assert_eq!(bio.try_result(), Some(0));
    }

    #[test]
    fn tag_take_resets_to_none() {
        let bio = Bio::read(Sector(0), 8);
        bio.set_tag(BioTag::WillCache { cell: 3 });
        assert_eq!(bio.take_tag(), BioTag::WillCache { cell: 3 });
        assert_eq!(bio.take_tag(), BioTag::None);
    }
}
