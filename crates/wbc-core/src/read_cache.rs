//! Opportunistic read-cache staging.
//!
//! Hot read misses reserve a cell; the payload is copied in on completion
//! and a batch worker later promotes uncancelled cells into the log through
//! the simplified write path. Sequential scans are detected by run length
//! and cancelled — retroactively for the run already reserved, eagerly for
//! everything after the threshold trips.

use crate::bio::{Bio, BioTag};
use crate::segment::Gate;
use crate::{LogCache, Staging};
use parking_lot::Mutex as PlMutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};
use wbc_block::AlignedBuf;
use wbc_types::{BLOCK_SIZE, Sector};

/// One promotion opportunity: a 4 KiB payload area keyed by sector.
///
/// `cancelled` is an atomic because the post-read callback and foreground
/// writers flip it without the staging lock.
#[derive(Debug)]
pub(crate) struct ReadCacheCell {
    sector: AtomicU64,
    cancelled: AtomicBool,
    data: PlMutex<AlignedBuf>,
}

impl ReadCacheCell {
    fn new() -> Self {
        Self {
            sector: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            data: PlMutex::new(AlignedBuf::new(BLOCK_SIZE)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Shared cell state: the pre-allocated array plus batch dispatch plumbing.
#[derive(Debug)]
pub(crate) struct ReadCacheCells {
    size: u32,
    array: Vec<ReadCacheCell>,
    ack_count: AtomicU32,
    batch_pending: AtomicBool,
    pub gate: Gate,
}

impl ReadCacheCells {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            array: (0..size).map(|_| ReadCacheCell::new()).collect(),
            ack_count: AtomicU32::new(size),
            batch_pending: AtomicBool::new(false),
            gate: Gate::new(),
        }
    }

    pub fn cell(&self, idx: u32) -> &ReadCacheCell {
        &self.array[idx as usize]
    }
}

/// Foreground reservation state, owned by the staging lock.
#[derive(Debug)]
pub(crate) struct CellsForeground {
    /// Draws down from `size` toward zero as cells are reserved.
    pub cursor: u32,
    /// Reserved cells sorted by sector.
    pub tree: BTreeMap<u64, u32>,
    last_sector: u64,
    seqcount: u32,
    over_threshold: bool,
    /// Run length above which reads are considered a scan. Refreshed from
    /// the tunable at batch reinit.
    threshold: u32,
}

impl CellsForeground {
    pub fn new(size: u32) -> Self {
        Self {
            cursor: size,
            tree: BTreeMap::new(),
            last_sector: u64::MAX,
            seqcount: 0,
            over_threshold: false,
            threshold: u32::MAX,
        }
    }
}

/// Cell indices belonging to sequential runs longer than `threshold`.
///
/// `cells` is `(sector, cell index)` sorted by sector; a run continues when
/// the next sector is exactly one cache line after the previous.
pub(crate) fn sequential_runs_to_cancel(cells: &[(u64, u32)], threshold: u32) -> Vec<u32> {
    let mut cancel = Vec::new();
    let mut last_sector = u64::MAX;
    let mut seqcount = 0_u32;
    let mut run_start = 0_usize;

    for (pos, (sector, _)) in cells.iter().enumerate() {
        if *sector == last_sector.wrapping_add(8) {
            seqcount += 1;
        } else {
            if seqcount > threshold {
                cancel.extend(cells[run_start..pos].iter().map(|(_, idx)| *idx));
            }
            seqcount = 1;
            run_start = pos;
        }
        last_sector = *sector;
    }
    if seqcount > threshold {
        cancel.extend(cells[run_start..].iter().map(|(_, idx)| *idx));
    }
    cancel
}

impl LogCache {
    /// Reserve a cell for a full-size read miss (staging lock held).
    pub(crate) fn reserve_read_cache_cell(&self, staging: &mut Staging, bio: &Arc<Bio>) {
        if self.tunables.read_cache_threshold() == 0 {
            return;
        }
        if staging.cells_fg.cursor == 0 || !bio.is_fullsize() {
            return;
        }

        // A sector already reserved is either unchanged or was invalidated
        // by a write; either way one cell is enough.
        let sector = bio.sector().0;
        if staging.cells_fg.tree.contains_key(&sector) {
            return;
        }

        let fg = &mut staging.cells_fg;
        fg.cursor -= 1;
        let cell_idx = fg.cursor;
        let cell = self.cells.cell(cell_idx);
        cell.sector.store(sector, Ordering::Release);
        fg.tree.insert(sector, cell_idx);
        bio.set_tag(BioTag::WillCache { cell: cell_idx });

        // Sequentiality detector: the scan is noticed late, so the current
        // run is cancelled retroactively; later arrivals in the same run
        // are cancelled on arrival.
        if sector == fg.last_sector.wrapping_add(8) {
            fg.seqcount += 1;
        } else {
            fg.seqcount = 1;
            fg.over_threshold = false;
        }
        if fg.seqcount > fg.threshold {
            if fg.over_threshold {
                cell.cancel();
            } else {
                fg.over_threshold = true;
                let last = (fg.cursor + fg.seqcount).min(self.cells.size);
                for i in fg.cursor..last {
                    self.cells.cell(i).cancel();
                }
                trace!(
                    target: "wbc::read_cache",
                    sector,
                    seqcount = fg.seqcount,
                    "sequential_run_cancelled"
                );
            }
        }
        fg.last_sector = sector;
    }

    /// Invalidate the reservation for `key` after a write made it stale
    /// (staging lock held).
    pub(crate) fn might_cancel_read_cache_cell(&self, staging: &mut Staging, key: Sector) {
        if let Some(&idx) = staging.cells_fg.tree.get(&key.0) {
            self.cells.cell(idx).cancel();
        }
    }

    /// Post-read callback for a `WillCache` bio.
    pub(crate) fn read_cache_copy_data(&self, bio: &Arc<Bio>, cell_idx: u32, error: i32) {
        let cell = self.cells.cell(cell_idx);
        if error != 0 {
            cell.cancel();
        }
        if !cell.is_cancelled() {
            let payload = bio.payload();
            let mut data = cell.data.lock();
            data.as_mut_slice().copy_from_slice(payload.as_slice());
        }
        if self.cells.ack_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cells.batch_pending.store(true, Ordering::Release);
            self.cells.gate.notify_all();
        }
    }

    /// Batch worker: runs once all reserved reads have completed.
    pub(crate) fn read_cache_loop(&self) {
        loop {
            let _ = self.cells.gate.wait_timeout_until(Duration::from_millis(50), || {
                self.is_stopping() || self.cells.batch_pending.load(Ordering::Acquire)
            });
            if self.is_stopping() {
                break;
            }
            if self.cells.batch_pending.swap(false, Ordering::AcqRel) {
                self.read_cache_batch();
            }
        }
    }

    fn read_cache_batch(&self) {
        // Second, whole-batch scan pass: runs can straddle the point where
        // the foreground detector reset.
        let (snapshot, threshold) = {
            let staging = self.staging.lock();
            let snapshot: Vec<(u64, u32)> = staging
                .cells_fg
                .tree
                .iter()
                .map(|(&sector, &idx)| (sector, idx))
                .collect();
            (snapshot, staging.cells_fg.threshold)
        };
        for idx in sequential_runs_to_cancel(&snapshot, threshold) {
            self.cells.cell(idx).cancel();
        }

        let mut promoted = 0_u32;
        for i in 0..self.cells.size {
            if self.inject_cell(i) {
                promoted += 1;
            }
        }
        trace!(
            target: "wbc::read_cache",
            batch_size = self.cells.size,
            promoted,
            "read_cache_batch_complete"
        );
        self.reinit_cells();
    }

    /// Promote one cell through the simplified write path. Returns whether
    /// the cell was staged.
    fn inject_cell(&self, cell_idx: u32) -> bool {
        let cell = self.cells.cell(cell_idx);
        let key = Sector(cell.sector.load(Ordering::Acquire));

        let mut staging = self.staging.lock();
        // A foreground write may have invalidated the cell after its read
        // completed; the data would be stale now.
        if cell.is_cancelled() {
            return false;
        }
        if let Err(err) = self.might_queue_current_buffer(&mut staging) {
            warn!(
                target: "wbc::read_cache",
                error = %err,
                "promotion_skipped_on_handoff_failure"
            );
            return false;
        }
        let write_pos = self.advance_cursor(&mut staging);
        let seg_slot = staging.current_slot;

        // Copy with the staging lock held so a write racing this promotion
        // cannot be overwritten by the older cell payload.
        {
            let rambuf = self.current_rambuf(&staging);
            let mut buf = rambuf.lock();
            let offset = self.rambuf_block_offset(write_pos);
            let data = cell.data.lock();
            buf.as_mut_slice()[offset..offset + BLOCK_SIZE].copy_from_slice(data.as_slice());
        }

        self.mbs[write_pos.0 as usize].stage_clean_full();
        let head = staging.index.head_of(key);
        staging.index.register(head, write_pos, key, &self.mbs);
        drop(staging);

        self.dec_inflight(seg_slot);
        trace!(target: "wbc::read_cache", key = key.0, slot = write_pos.0, "read_cache_promoted");
        true
    }

    /// Reset cells for the next batch round.
    pub(crate) fn reinit_cells(&self) {
        for i in 0..self.cells.size {
            self.cells.cell(i).cancelled.store(false, Ordering::Release);
        }
        self.cells.ack_count.store(self.cells.size, Ordering::Release);

        let mut staging = self.staging.lock();
        let fg = &mut staging.cells_fg;
        fg.tree.clear();
        fg.cursor = self.cells.size;
        let configured = u32::from(self.tunables.read_cache_threshold());
        if configured != 0 && configured != fg.threshold {
            fg.threshold = configured;
            fg.over_threshold = false;
        }
    }
}
