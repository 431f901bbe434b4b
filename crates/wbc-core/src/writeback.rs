//! Background daemons: writeback, superblock recorder, periodic sync, and
//! the barrier deadline timer.
//!
//! Writeback drains dirty lines of flushed segments to the backing device
//! in id order, bounded by `nr_max_batched_writeback` segments per pass. It
//! engages when the dirty percentage crosses `writeback_threshold`, when a
//! hand-off is starved for ring space (urge), or when `drop_caches` forces a
//! full drain.

use crate::LogCache;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, warn};
use wbc_error::Result;
use wbc_types::{CacheSlot, SECTOR_SIZE, Sector, SegmentId};

const WRITEBACK_POLL: Duration = Duration::from_millis(50);

impl LogCache {
    pub(crate) fn writeback_loop(&self) {
        let mut sector_buf = vec![0_u8; SECTOR_SIZE];
        loop {
            let _ = self.writeback_gate.wait_timeout_until(WRITEBACK_POLL, || {
                self.is_stopping() || self.writeback_work_available()
            });
            if self.is_stopping() {
                break;
            }
            while self.writeback_work_available() && !self.is_stopping() {
                if let Err(err) = self.writeback_batch(&mut sector_buf) {
                    error!(
                        target: "wbc::writeback",
                        error = %err,
                        "writeback_batch_failed"
                    );
                    break;
                }
            }
        }
    }

    fn writeback_work_available(&self) -> bool {
        let last_writeback = self.written_back.current();
        if last_writeback >= self.flushed.current() {
            return false;
        }
        if self.force_drop.load(Ordering::Acquire) || self.urge_writeback.load(Ordering::Acquire) {
            return true;
        }
        let threshold = self.tunables.writeback_threshold();
        if threshold == 0 {
            return true;
        }
        let dirty_pct = self.dirty.count() * 100 / u64::from(self.geo.nr_caches());
        dirty_pct >= u64::from(threshold)
    }

    fn writeback_batch(&self, sector_buf: &mut [u8]) -> Result<()> {
        let last_writeback = self.written_back.current();
        let upto = (last_writeback + u64::from(self.tunables.nr_max_batched_writeback()))
            .min(self.flushed.current());
        for id in last_writeback + 1..=upto {
            self.writeback_segment(SegmentId(id), sector_buf)?;
            self.written_back.advance(id);
        }
        Ok(())
    }

    /// Copy every dirty sector of segment `id` from the cache device to the
    /// backing device, then mark the lines clean.
    ///
    /// Lines merged forward by an overwrite are already clean and skipped;
    /// their newer bytes live in a younger segment.
    fn writeback_segment(&self, id: SegmentId, sector_buf: &mut [u8]) -> Result<()> {
        let slot = self.geo.slot_of_id(id);
        let seg = &self.segments[slot as usize];
        if seg.id() != id {
            // The slot was already reused, which is only possible after `id`
            // was fully written back under a now-stale superblock record.
            return Ok(());
        }

        let start = seg.start_idx().0;
        let mut cleaned = 0_u32;
        for i in 0..seg.length() {
            let idx = CacheSlot(start + i);
            let mb = &self.mbs[idx.0 as usize];
            let d = mb.read_dirtiness();
            if !d.is_dirty || d.data_bits.is_empty() {
                continue;
            }
            let key = mb.key();
            let line_start = self.geo.mb_start_sector(idx);
            for s in d.data_bits.sectors() {
                self.cache_dev
                    .read_at(Sector(line_start.0 + u64::from(s)), sector_buf)?;
                self.backing
                    .write_at(Sector(key.0 + u64::from(s)), sector_buf)?;
            }
            if mb.mark_clean() {
                self.dirty.dec();
                cleaned += 1;
            }
        }
        // The record must never run ahead of actual backing durability.
        self.backing.sync()?;
        debug!(
            target: "wbc::writeback",
            id = id.0,
            cleaned,
            nr_dirty_caches = self.dirty.count(),
            "segment_written_back"
        );
        Ok(())
    }

    /// Persist `last_writeback_id` into the superblock record.
    pub fn record_superblock(&self) -> Result<()> {
        let mut scratch = self.buf_1_pool.try_alloc()?;
        let id = self.written_back.current();
        crate::ondisk::write_superblock_record(
            self.cache_dev.as_ref(),
            self.geo,
            id,
            scratch.as_mut_slice(),
        )?;
        debug!(target: "wbc::writeback", last_writeback_id = id, "superblock_recorded");
        Ok(())
    }

    pub(crate) fn recorder_loop(&self) {
        let mut last_recorded = self.written_back.current();
        loop {
            let interval = self.tunables.update_sb_record_interval();
            let sleep = if interval == 0 {
                Duration::from_millis(500)
            } else {
                Duration::from_secs(interval)
            };
            if self.stop_gate.wait_timeout_until(sleep, || self.is_stopping()) {
                break;
            }
            if interval == 0 {
                continue;
            }
            let current = self.written_back.current();
            if current != last_recorded {
                match self.record_superblock() {
                    Ok(()) => last_recorded = current,
                    Err(err) => warn!(
                        target: "wbc::writeback",
                        error = %err,
                        "superblock_record_failed"
                    ),
                }
            }
        }
    }

    pub(crate) fn sync_loop(&self) {
        loop {
            let interval = self.tunables.sync_data_interval();
            let sleep = if interval == 0 {
                Duration::from_millis(500)
            } else {
                Duration::from_secs(interval)
            };
            if self.stop_gate.wait_timeout_until(sleep, || self.is_stopping()) {
                break;
            }
            if interval == 0 {
                continue;
            }
            if let Err(err) = self
                .flush_current_buffer()
                .and_then(|()| self.cache_dev.sync())
            {
                warn!(target: "wbc::flush", error = %err, "periodic_sync_failed");
            }
        }
    }

    /// Bound barrier latency: if barriers sit queued past the deadline with
    /// no hand-off delivering them, force one.
    pub(crate) fn barrier_deadline_loop(&self) {
        loop {
            let deadline = Duration::from_millis(self.tunables.barrier_deadline_ms());
            let tick = (deadline / 2).max(Duration::from_millis(1));
            if self.stop_gate.wait_timeout_until(tick, || self.is_stopping()) {
                break;
            }
            let expired = {
                let queue = self.barriers.lock();
                queue.since.is_some_and(|since| since.elapsed() >= deadline)
            };
            if expired {
                if let Err(err) = self.flush_current_buffer() {
                    warn!(
                        target: "wbc::flush",
                        error = %err,
                        "barrier_deadline_flush_failed"
                    );
                }
            }
        }
    }
}
