//! In-memory metablock and segment model, plus the small blocking
//! primitives the core waits on: the inflight gate and the dirty gauge.
//!
//! Dirtiness obeys two monotonicity rules that keep its locking trivial:
//! while a line is on the RAM buffer its dirtiness only grows (`taint`),
//! and once flushed it only shrinks (`mark_clean`). The per-line mutex
//! protects exactly those transitions and nothing else.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use wbc_types::{CacheSlot, Sector, SectorMask, SegmentId};

/// Per-sector dirtiness of one cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dirtiness {
    pub is_dirty: bool,
    pub data_bits: SectorMask,
}

/// In-memory descriptor of one 4 KiB cache line.
///
/// The key is atomic so background writeback can address lines without the
/// staging lock; key updates themselves are serialized by that lock.
#[derive(Debug)]
pub struct Metablock {
    idx: CacheSlot,
    key: AtomicU64,
    dirtiness: Mutex<Dirtiness>,
}

impl Metablock {
    #[must_use]
    pub fn new(idx: CacheSlot) -> Self {
        Self {
            idx,
            key: AtomicU64::new(0),
            dirtiness: Mutex::new(Dirtiness::default()),
        }
    }

    #[must_use]
    pub fn idx(&self) -> CacheSlot {
        self.idx
    }

    #[must_use]
    pub fn key(&self) -> Sector {
        Sector(self.key.load(Ordering::Acquire))
    }

    pub fn set_key(&self, key: Sector) {
        self.key.store(key.0, Ordering::Release);
    }

    #[must_use]
    pub fn read_dirtiness(&self) -> Dirtiness {
        *self.dirtiness.lock()
    }

    /// Grow the dirtiness by `bits`. Returns true on a clean→dirty flip.
    ///
    /// # Panics
    ///
    /// Panics when `bits` is empty; tainting nothing is a caller bug.
    pub fn taint(&self, bits: SectorMask) -> bool {
        assert!(!bits.is_empty(), "taint with empty sector mask");
        let mut d = self.dirtiness.lock();
        let flipped = !d.is_dirty;
        d.is_dirty = true;
        d.data_bits = d.data_bits.union(bits);
        flipped
    }

    /// Drop the dirty flag, keeping `data_bits` so the flushed line can
    /// still be served from the cache device. Returns true on a flip.
    pub fn mark_clean(&self) -> bool {
        let mut d = self.dirtiness.lock();
        let flipped = d.is_dirty;
        d.is_dirty = false;
        flipped
    }

    /// Reset for a fresh write slot allocation.
    ///
    /// # Panics
    ///
    /// Panics if the line is still dirty; segment acquisition must have
    /// drained it first.
    pub fn reset_for_write(&self) {
        let mut d = self.dirtiness.lock();
        assert!(
            !d.is_dirty,
            "dirty cache line {} handed out as a write slot",
            self.idx
        );
        d.data_bits = SectorMask::EMPTY;
    }

    /// Install a full clean line (read-cache promotion): every sector is
    /// valid on the cache device, none is newer than backing.
    ///
    /// # Panics
    ///
    /// Panics if the line is dirty.
    pub fn stage_clean_full(&self) {
        let mut d = self.dirtiness.lock();
        assert!(!d.is_dirty, "clean promotion over dirty line {}", self.idx);
        d.data_bits = SectorMask::FULL;
    }
}

/// Ring-slot segment descriptor.
///
/// `id`, `length` and the inflight count are atomics: they are written under
/// the staging lock (or by the owner at hand-off) but read by the flusher
/// and writeback threads without it.
#[derive(Debug)]
pub struct SegmentHeader {
    slot: u64,
    start_idx: CacheSlot,
    start_sector: Sector,
    id: AtomicU64,
    length: AtomicU32,
    nr_inflight_ios: AtomicU32,
}

impl SegmentHeader {
    #[must_use]
    pub fn new(slot: u64, start_idx: CacheSlot, start_sector: Sector) -> Self {
        Self {
            slot,
            start_idx,
            start_sector,
            id: AtomicU64::new(0),
            length: AtomicU32::new(0),
            nr_inflight_ios: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn slot(&self) -> u64 {
        self.slot
    }

    #[must_use]
    pub fn start_idx(&self) -> CacheSlot {
        self.start_idx
    }

    #[must_use]
    pub fn start_sector(&self) -> Sector {
        self.start_sector
    }

    #[must_use]
    pub fn id(&self) -> SegmentId {
        SegmentId(self.id.load(Ordering::Acquire))
    }

    pub fn set_id(&self, id: SegmentId) {
        self.id.store(id.0, Ordering::Release);
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Acquire)
    }

    pub fn set_length(&self, length: u32) {
        self.length.store(length, Ordering::Release);
    }

    /// Count one committed cache line; returns the new length.
    pub fn bump_length(&self) -> u32 {
        self.length.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn inflight(&self) -> u32 {
        self.nr_inflight_ios.load(Ordering::Acquire)
    }

    pub fn inc_inflight(&self) {
        self.nr_inflight_ios.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one inflight reference; returns true when the count hit zero.
    pub fn dec_inflight(&self) -> bool {
        let prev = self.nr_inflight_ios.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "inflight underflow on segment slot {}", self.slot);
        prev == 1
    }
}

// ---------------------------------------------------------------------------
// Blocking primitives
// ---------------------------------------------------------------------------

/// Condition-variable gate over externally owned (usually atomic) state.
///
/// Notifiers must update the observed state *before* `notify_all`; the gate
/// serializes the predicate check against the notification through its
/// internal mutex so wakeups cannot be lost.
#[derive(Debug, Default)]
pub struct Gate {
    lock: StdMutex<()>,
    cv: Condvar,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until(&self, pred: impl Fn() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !pred() {
            guard = self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait until `pred` holds or `timeout` elapses; returns whether the
    /// predicate held on exit.
    pub fn wait_timeout_until(&self, timeout: Duration, pred: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if pred() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return pred();
            }
            let (g, _timed_out) = self
                .cv
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            guard = g;
        }
    }

    pub fn notify_all(&self) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cv.notify_all();
    }
}

/// Global dirty cache-line count with a drain wait for `drop_caches`.
#[derive(Debug, Default)]
pub struct DirtyGauge {
    count: AtomicU64,
    gate: Gate,
}

impl DirtyGauge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "nr_dirty_caches underflow");
        if prev == 1 {
            self.gate.notify_all();
        }
    }

    pub fn wait_zero(&self) {
        self.gate.wait_until(|| self.count() == 0);
    }
}
