#![forbid(unsafe_code)]
//! Log-structured write-back block cache core.
//!
//! `LogCache` sits between a slow backing device and a fast cache device
//! and presents both to the host block layer through `map`/`end_io`.
//! Incoming writes are staged into RAM-buffered segments and appended to a
//! circular log on the cache device; a hash index maps backing keys to
//! cached lines; background daemons flush segments, write dirty lines back,
//! and record recovery metadata.
//!
//! Locking discipline, in acquisition order:
//! 1. `staging` — one mutex over the index, cursor, and read-cache
//!    reservations; every write and every index update happens under it,
//!    held only for bounded non-I/O work (with the single exception of the
//!    merge read in `prepare_overwrite`, which keeps same-key writes
//!    serialized).
//! 2. RAM buffer / cell payload mutexes — per-buffer byte copies.
//! 3. Per-line dirtiness mutexes — single-field transitions.
//!
//! Daemons coordinate through monotonic id notifiers (`last_flushed_id`,
//! `last_writeback_id`) and never take the staging lock while a foreground
//! thread could be waiting on them.

mod bio;
mod config;
mod flush;
mod index;
mod ondisk;
mod read_cache;
mod segment;
mod writeback;

pub use bio::{Bio, BioKind, BioTag};
pub use config::{CacheOptions, TunableSnapshot};
pub use ondisk::format_cache;

use config::Tunables;
use flush::{FlushJob, FlushQueue, IdNotifier};
use index::HashIndex;
use parking_lot::Mutex as PlMutex;
use read_cache::{CellsForeground, ReadCacheCells};
use segment::{Dirtiness, DirtyGauge, Gate, Metablock, SegmentHeader};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use wbc_block::{AlignedBuf, ScratchPool, SectorDevice};
use wbc_error::{CacheError, Result};
use wbc_types::{BLOCK_SIZE, CacheSlot, Geometry, SECTOR_SIZE, Sector, SectorMask, SegmentId};

const BUF_1_POOL_SIZE: usize = 16;
const BUF_8_POOL_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Map outcome
// ---------------------------------------------------------------------------

/// Device a remapped request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Backing,
    Cache,
}

/// Rewritten target for a remapped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remap {
    pub target: DeviceRole,
    pub sector: Sector,
}

/// Result of `map`: either the core consumed the request (its completion
/// arrives through the bio), or the host must perform the rewritten
/// transfer and then call `end_io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    Submitted,
    Remapped(Remap),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Request counters bucketed by (write, hit, on_buffer, fullsize).
#[derive(Debug, Default)]
pub struct Stats {
    buckets: [AtomicU64; 16],
    non_full_flushed: AtomicU64,
}

const STAT_WRITE: usize = 0;
const STAT_HIT: usize = 1;
const STAT_ON_BUFFER: usize = 2;
const STAT_FULLSIZE: usize = 3;

impl Stats {
    fn record(&self, write: bool, hit: bool, on_buffer: bool, fullsize: bool) {
        let mut i = 0_usize;
        if write {
            i |= 1 << STAT_WRITE;
        }
        if hit {
            i |= 1 << STAT_HIT;
        }
        if on_buffer {
            i |= 1 << STAT_ON_BUFFER;
        }
        if fullsize {
            i |= 1 << STAT_FULLSIZE;
        }
        self.buckets[i].fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.non_full_flushed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn inc_non_full_flushed(&self) {
        self.non_full_flushed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [u64; 16] {
        let mut out = [0_u64; 16];
        for (slot, bucket) in out.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        out
    }
}

/// Point-in-time device status, mirroring what a control plane reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub cursor: u32,
    pub nr_caches: u32,
    pub nr_segments: u64,
    pub current_segment_id: u64,
    pub last_flushed_id: u64,
    pub last_writeback_id: u64,
    pub nr_dirty_caches: u64,
    pub stat: [u64; 16],
    pub count_non_full_flushed: u64,
    pub tunables: TunableSnapshot,
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

/// State serialized by the staging lock: the hash index, the write cursor,
/// the current ring slot, and read-cache reservations.
pub(crate) struct Staging {
    pub cursor: u32,
    pub current_slot: u64,
    pub index: HashIndex,
    pub cells_fg: CellsForeground,
}

struct BarrierQueue {
    bios: Vec<Arc<Bio>>,
    since: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Found {
    idx: CacheSlot,
    seg_slot: u64,
    on_buffer: bool,
}

/// The cache device instance.
///
/// Construct with [`LogCache::resume`] over a formatted cache device; tear
/// down with [`LogCache::shutdown`], which flushes transient state and joins
/// the worker threads.
pub struct LogCache {
    geo: Geometry,
    opts: CacheOptions,
    tunables: Tunables,

    backing: Arc<dyn SectorDevice>,
    cache_dev: Arc<dyn SectorDevice>,

    buf_1_pool: Arc<ScratchPool>,
    buf_8_pool: Arc<ScratchPool>,

    segments: Vec<SegmentHeader>,
    mbs: Vec<Metablock>,
    rambufs: Vec<Arc<PlMutex<AlignedBuf>>>,

    staging: PlMutex<Staging>,
    inflight_gate: Gate,
    dirty: DirtyGauge,

    flush_queue: FlushQueue,
    flushed: IdNotifier,
    written_back: IdNotifier,
    barriers: PlMutex<BarrierQueue>,

    cells: ReadCacheCells,
    stats: Stats,

    force_drop: AtomicBool,
    urge_writeback: AtomicBool,
    writeback_gate: Gate,
    stop_gate: Gate,
    shutdown_started: AtomicBool,
    stopping: AtomicBool,
    workers: PlMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCache").finish_non_exhaustive()
    }
}

impl LogCache {
    /// Bring the cache up over a formatted cache device, rebuilding the
    /// index from surviving segment headers.
    pub fn resume(
        backing: Arc<dyn SectorDevice>,
        cache_dev: Arc<dyn SectorDevice>,
        opts: CacheOptions,
    ) -> Result<Arc<LogCache>> {
        opts.validate()?;
        let geo = Geometry::from_device(opts.segment_size_order, cache_dev.size_sectors())
            .map_err(|e| CacheError::Format(e.to_string()))?;
        ondisk::validate_superblock(cache_dev.as_ref())?;
        let last_writeback = ondisk::read_superblock_record(cache_dev.as_ref(), geo)?;
        let scans = ondisk::scan_segments(cache_dev.as_ref(), geo)?;
        let max_id = scans.last().map_or(0, |s| s.id.0);
        if last_writeback > max_id {
            return Err(CacheError::Corruption {
                sector: geo.superblock_record_sector().0,
                detail: format!(
                    "superblock record {last_writeback} is ahead of the log tail {max_id}"
                ),
            });
        }

        let segments: Vec<SegmentHeader> = (0..geo.nr_segments())
            .map(|slot| {
                SegmentHeader::new(slot, geo.first_slot_of_seg(slot), geo.segment_start_sector(slot))
            })
            .collect();
        let mbs: Vec<Metablock> = (0..geo.nr_caches())
            .map(|i| Metablock::new(CacheSlot(i)))
            .collect();
        let rambuf_len = (geo.caches_per_seg() as usize + 1) * BLOCK_SIZE;
        let rambufs = (0..opts.nr_rambuf)
            .map(|_| Arc::new(PlMutex::new(AlignedBuf::new(rambuf_len))))
            .collect();

        let cache = Arc::new(LogCache {
            geo,
            tunables: Tunables::new(&opts),
            opts,
            backing,
            cache_dev,
            buf_1_pool: ScratchPool::new("buf_1", SECTOR_SIZE, BUF_1_POOL_SIZE),
            buf_8_pool: ScratchPool::new("buf_8", BLOCK_SIZE, BUF_8_POOL_SIZE),
            segments,
            mbs,
            rambufs,
            staging: PlMutex::new(Staging {
                cursor: 0,
                current_slot: 0,
                index: HashIndex::new(geo.htsize(), geo.nr_caches()),
                cells_fg: CellsForeground::new(opts.nr_read_cache_cells),
            }),
            inflight_gate: Gate::new(),
            dirty: DirtyGauge::new(),
            flush_queue: FlushQueue::new(),
            flushed: IdNotifier::new(max_id),
            written_back: IdNotifier::new(last_writeback),
            barriers: PlMutex::new(BarrierQueue {
                bios: Vec::new(),
                since: None,
            }),
            cells: ReadCacheCells::new(opts.nr_read_cache_cells),
            stats: Stats::default(),
            force_drop: AtomicBool::new(false),
            urge_writeback: AtomicBool::new(false),
            writeback_gate: Gate::new(),
            stop_gate: Gate::new(),
            shutdown_started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            workers: PlMutex::new(Vec::new()),
        });

        cache.replay(&scans, last_writeback);
        cache.spawn_workers()?;
        {
            let mut staging = cache.staging.lock();
            cache.acquire_new_segment(&mut staging, SegmentId(max_id + 1))?;
            staging.cursor = cache.segments[staging.current_slot as usize].start_idx().0;
        }
        cache.reinit_cells();
        cache.stats.clear();

        info!(
            target: "wbc::resume",
            nr_segments = geo.nr_segments(),
            nr_caches = geo.nr_caches(),
            current_segment_id = max_id + 1,
            last_writeback_id = last_writeback,
            nr_dirty_caches = cache.dirty.count(),
            "cache_resumed"
        );
        Ok(cache)
    }

    /// Rebuild the index from scanned headers. Only dirty lines are
    /// recovered; a younger copy of a key displaces an older one.
    fn replay(&self, scans: &[ondisk::ScannedSegment], last_writeback: u64) {
        let mut staging = self.staging.lock();
        for scan in scans {
            let seg = &self.segments[scan.slot as usize];
            seg.set_id(scan.id);
            seg.set_length(scan.length);
            if scan.id.0 <= last_writeback {
                continue;
            }
            for rec in &scan.records {
                let idx = CacheSlot(seg.start_idx().0 + rec.index_in_seg);
                let head = staging.index.head_of(rec.key);
                if let Some(prev) = staging.index.lookup(head, rec.key, &self.mbs) {
                    staging.index.delete(prev);
                    if self.mbs[prev.0 as usize].mark_clean() {
                        self.dirty.dec();
                    }
                }
                staging.index.register(head, idx, rec.key, &self.mbs);
                if self.mbs[idx.0 as usize].taint(rec.dirty_bits) {
                    self.dirty.inc();
                }
            }
        }
    }

    fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock();
        for (name, entry) in [
            ("wbc-flusher", LogCache::flusher_loop as fn(&LogCache)),
            ("wbc-read-cache", LogCache::read_cache_loop),
            ("wbc-writeback", LogCache::writeback_loop),
            ("wbc-sb-recorder", LogCache::recorder_loop),
            ("wbc-sync", LogCache::sync_loop),
            ("wbc-barrier", LogCache::barrier_deadline_loop),
        ] {
            let cache = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || entry(&cache))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Flush transient state, stop and join the workers, and persist the
    /// superblock record. Idempotent.
    ///
    /// The caller must have quiesced foreground I/O first, as a device
    /// teardown would.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }
        // The final hand-off may need the writeback daemon (ring space), so
        // it runs before the workers are told to stop.
        if let Err(err) = self.flush_current_buffer() {
            error!(target: "wbc::flush", error = %err, "shutdown_flush_failed");
        }
        self.stopping.store(true, Ordering::Release);
        self.flush_queue.stop();
        self.stop_gate.notify_all();
        self.writeback_gate.notify_all();
        self.cells.gate.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        if let Err(err) = self.record_superblock() {
            warn!(target: "wbc::writeback", error = %err, "shutdown_record_failed");
        }
        if let Err(err) = self.cache_dev.sync() {
            warn!(target: "wbc::flush", error = %err, "shutdown_sync_failed");
        }
        info!(target: "wbc::resume", "cache_shut_down");
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geo
    }

    #[must_use]
    pub fn nr_dirty_caches(&self) -> u64 {
        self.dirty.count()
    }

    #[must_use]
    pub fn last_flushed_id(&self) -> u64 {
        self.flushed.current()
    }

    #[must_use]
    pub fn last_writeback_id(&self) -> u64 {
        self.written_back.current()
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let (cursor, current_segment_id) = {
            let staging = self.staging.lock();
            let seg = &self.segments[staging.current_slot as usize];
            (staging.cursor, seg.id().0)
        };
        StatusSnapshot {
            cursor,
            nr_caches: self.geo.nr_caches(),
            nr_segments: self.geo.nr_segments(),
            current_segment_id,
            last_flushed_id: self.flushed.current(),
            last_writeback_id: self.written_back.current(),
            nr_dirty_caches: self.dirty.count(),
            stat: self.stats.snapshot(),
            count_non_full_flushed: self.stats.non_full_flushed.load(Ordering::Relaxed),
            tunables: self.tunables.snapshot(),
        }
    }

    // -- control messages ---------------------------------------------------

    /// Handle a control message: `clear_stat`, `drop_caches`, or a
    /// `key value` pair reconfiguring a tunable.
    pub fn message(&self, argv: &[&str]) -> Result<()> {
        match argv {
            ["clear_stat"] => {
                self.stats.clear();
                Ok(())
            }
            ["drop_caches"] => self.drop_caches(),
            [key, value] => {
                let value: u64 = value.parse().map_err(|_| {
                    CacheError::InvalidConfig(format!("invalid value for {key}: {value}"))
                })?;
                self.tunables.set(key, value)
            }
            _ => Err(CacheError::InvalidConfig(format!(
                "unrecognized message {argv:?}"
            ))),
        }
    }

    /// Flush the current buffer and block until every dirty line has been
    /// written back.
    pub fn drop_caches(&self) -> Result<()> {
        self.flush_current_buffer()?;
        self.force_drop.store(true, Ordering::Release);
        self.writeback_gate.notify_all();
        self.dirty.wait_zero();
        self.force_drop.store(false, Ordering::Release);
        info!(target: "wbc::writeback", "caches_dropped");
        Ok(())
    }

    // -- host entry points --------------------------------------------------

    /// Map one request. `Submitted` means the core owns it (completion
    /// arrives via the bio); `Remapped` means the host must perform the
    /// rewritten transfer, then call [`LogCache::end_io`] before completing
    /// the request itself.
    pub fn map(&self, bio: &Arc<Bio>) -> MapOutcome {
        bio.set_tag(BioTag::None);
        if self.is_stopping() {
            bio.complete(CacheError::ShuttingDown.to_errno());
            return MapOutcome::Submitted;
        }
        match bio.kind() {
            BioKind::Flush => {
                self.queue_barrier(Arc::clone(bio));
                MapOutcome::Submitted
            }
            BioKind::Write => self.process_write(bio),
            BioKind::Read => self.process_read(bio),
        }
    }

    /// Completion hook for remapped requests, dispatching on the per-bio
    /// tag set by `map`.
    pub fn end_io(&self, bio: &Arc<Bio>, error: i32) {
        match bio.take_tag() {
            BioTag::None => {}
            BioTag::WillCache { cell } => self.read_cache_copy_data(bio, cell, error),
            BioTag::ReadSeg { slot } => self.dec_inflight(slot),
        }
    }

    // -- write path ---------------------------------------------------------

    fn process_write(&self, bio: &Arc<Bio>) -> MapOutcome {
        if self.opts.write_around_mode {
            return self.process_write_around(bio);
        }
        match self.do_process_write(bio) {
            Ok(()) => {
                if bio.fua() {
                    // FUA data is staged like a normal write; durability is
                    // realized by the next segment flush.
                    self.queue_barrier(Arc::clone(bio));
                } else {
                    bio.complete(0);
                }
            }
            Err(err) => {
                warn!(
                    target: "wbc::write",
                    sector = bio.sector().0,
                    error = %err,
                    "write_failed"
                );
                bio.complete(err.to_errno());
            }
        }
        MapOutcome::Submitted
    }

    fn do_process_write(&self, bio: &Arc<Bio>) -> Result<()> {
        let mut scratch = self.buf_8_pool.try_alloc()?;
        let offset = bio.block_offset();
        {
            let payload = bio.payload();
            let start = usize::from(offset) * SECTOR_SIZE;
            scratch.as_mut_slice()[start..start + payload.len()].copy_from_slice(payload.as_slice());
        }
        let mut wio_bits = SectorMask::span(offset, bio.len_sectors());
        let key = bio.sector().align_to_block();

        let mut staging = self.staging.lock();
        let res = self.cache_lookup(&staging, key, true, bio.is_fullsize());
        let write_pos = match res {
            Some(found) if found.on_buffer => found.idx,
            Some(found) => {
                let merged = self.prepare_overwrite(
                    &mut staging,
                    found,
                    scratch.as_mut_slice(),
                    &mut wio_bits,
                );
                self.dec_inflight(found.seg_slot);
                merged?;
                self.might_queue_current_buffer(&mut staging)?;
                self.advance_cursor(&mut staging)
            }
            None => {
                self.might_cancel_read_cache_cell(&mut staging, key);
                self.might_queue_current_buffer(&mut staging)?;
                self.advance_cursor(&mut staging)
            }
        };

        let seg_slot = staging.current_slot;
        {
            let rambuf = self.current_rambuf(&staging);
            let mut buf = rambuf.lock();
            let off = self.rambuf_block_offset(write_pos);
            let line = &mut buf.as_mut_slice()[off..off + BLOCK_SIZE];
            if wio_bits.is_full() {
                line.copy_from_slice(scratch.as_slice());
            } else {
                copy_masked(line, SectorMask::EMPTY, scratch.as_slice(), wio_bits);
            }
        }
        if self.mbs[write_pos.0 as usize].taint(wio_bits) {
            self.dirty.inc();
        }
        let head = staging.index.head_of(key);
        staging.index.register(head, write_pos, key, &self.mbs);
        drop(staging);

        self.dec_inflight(seg_slot);
        trace!(
            target: "wbc::write",
            key = key.0,
            slot = write_pos.0,
            bits = %wio_bits,
            "write_staged"
        );
        Ok(())
    }

    /// Merge forward older dirty sectors the incoming write does not cover,
    /// then retire the old line from the index.
    ///
    /// On error the old line stays registered and dirty; the caller fails
    /// the request.
    fn prepare_overwrite(
        &self,
        staging: &mut Staging,
        found: Found,
        new_data: &mut [u8],
        new_bits: &mut SectorMask,
    ) -> Result<()> {
        let mb = &self.mbs[found.idx.0 as usize];
        let d = mb.read_dirtiness();
        let stale_dirty = d.data_bits.difference(*new_bits);
        if d.is_dirty && !new_bits.is_full() && !stale_dirty.is_empty() {
            // The old line's bytes live on the cache device only once its
            // segment is durable.
            let id = self.segments[found.seg_slot as usize].id();
            self.flushed.wait_for(id.0)?;
            let mut merge = self.buf_8_pool.try_alloc()?;
            self.read_cached_sectors(found.idx, d.data_bits, merge.as_mut_slice())?;
            // Newer data wins: only sectors outside the incoming mask move.
            copy_masked(new_data, *new_bits, merge.as_slice(), d.data_bits);
            *new_bits = new_bits.union(d.data_bits);
            trace!(
                target: "wbc::write",
                key = mb.key().0,
                merged_bits = %d.data_bits,
                "overwrite_merged_forward"
            );
        }
        if mb.mark_clean() {
            self.dirty.dec();
        }
        staging.index.delete(found.idx);
        Ok(())
    }

    fn process_write_around(&self, bio: &Arc<Bio>) -> MapOutcome {
        let key = bio.sector().align_to_block();
        let mut staging = self.staging.lock();
        if let Some(found) = self.cache_lookup(&staging, key, true, bio.is_fullsize()) {
            self.dec_inflight(found.seg_slot);
            staging.index.delete(found.idx);
        }
        self.might_cancel_read_cache_cell(&mut staging, key);
        drop(staging);
        MapOutcome::Remapped(Remap {
            target: DeviceRole::Backing,
            sector: bio.sector(),
        })
    }

    // -- read path ----------------------------------------------------------

    fn process_read(&self, bio: &Arc<Bio>) -> MapOutcome {
        let key = bio.sector().align_to_block();
        let found = {
            let mut staging = self.staging.lock();
            let found = self.cache_lookup(&staging, key, false, bio.is_fullsize());
            if found.is_none() {
                self.reserve_read_cache_cell(&mut staging, bio);
            }
            found
        };
        let Some(found) = found else {
            return MapOutcome::Remapped(Remap {
                target: DeviceRole::Backing,
                sector: bio.sector(),
            });
        };

        let d = self.mbs[found.idx.0 as usize].read_dirtiness();
        if found.on_buffer {
            let read = self.read_from_rambuf(bio, found, d);
            self.dec_inflight(found.seg_slot);
            self.complete_read(bio, read);
            return MapOutcome::Submitted;
        }

        // Reads must not race ahead of the owning segment's flush.
        let id = self.segments[found.seg_slot as usize].id();
        if let Err(err) = self.flushed.wait_for(id.0) {
            self.dec_inflight(found.seg_slot);
            self.complete_read(bio, Err(err));
            return MapOutcome::Submitted;
        }

        if d.data_bits.is_full() {
            // Serve straight from the cache device; the segment keeps an
            // inflight reference until end_io.
            bio.set_tag(BioTag::ReadSeg {
                slot: found.seg_slot,
            });
            let sector = Sector(self.geo.mb_start_sector(found.idx).0 + u64::from(bio.block_offset()));
            return MapOutcome::Remapped(Remap {
                target: DeviceRole::Cache,
                sector,
            });
        }

        let read = self.read_reconstruct(bio, found, d);
        self.dec_inflight(found.seg_slot);
        self.complete_read(bio, read);
        MapOutcome::Submitted
    }

    fn complete_read(&self, bio: &Arc<Bio>, read: Result<()>) {
        match read {
            Ok(()) => bio.complete(0),
            Err(err) => {
                warn!(
                    target: "wbc::read",
                    sector = bio.sector().0,
                    error = %err,
                    "read_failed"
                );
                bio.complete(err.to_errno());
            }
        }
    }

    /// Serve a hit on the active RAM buffer.
    fn read_from_rambuf(&self, bio: &Arc<Bio>, found: Found, d: Dirtiness) -> Result<()> {
        let rambuf = self.rambuf_for(self.segments[found.seg_slot as usize].id());
        let off = self.rambuf_block_offset(found.idx);

        if d.data_bits.is_full() {
            let buf = rambuf.lock();
            let line = &buf.as_slice()[off..off + BLOCK_SIZE];
            let start = usize::from(bio.block_offset()) * SECTOR_SIZE;
            let mut payload = bio.payload();
            let len = payload.len();
            payload.copy_from_slice(&line[start..start + len]);
            return Ok(());
        }

        // Partial line: synthesize from backing, then overlay the buffered
        // dirty sectors.
        self.fill_from_backing(bio)?;
        if d.is_dirty {
            let buf = rambuf.lock();
            let line = &buf.as_slice()[off..off + BLOCK_SIZE];
            overlay_payload(bio, line, d.data_bits);
        }
        Ok(())
    }

    /// Serve a partial hit on a flushed segment: backing bytes plus the
    /// dirty sectors read from the cache device.
    fn read_reconstruct(&self, bio: &Arc<Bio>, found: Found, d: Dirtiness) -> Result<()> {
        self.fill_from_backing(bio)?;
        if d.is_dirty && !d.data_bits.is_empty() {
            let mut scratch = self.buf_8_pool.try_alloc()?;
            self.read_cached_sectors(found.idx, d.data_bits, scratch.as_mut_slice())?;
            overlay_payload(bio, scratch.as_slice(), d.data_bits);
        }
        Ok(())
    }

    fn fill_from_backing(&self, bio: &Arc<Bio>) -> Result<()> {
        let mut payload = bio.payload();
        self.backing.read_at(bio.sector(), payload.as_mut_slice())
    }

    /// Read the sectors named by `bits` from the cache device into the
    /// matching offsets of `buf`.
    fn read_cached_sectors(&self, idx: CacheSlot, bits: SectorMask, buf: &mut [u8]) -> Result<()> {
        let line_start = self.geo.mb_start_sector(idx);
        for s in bits.sectors() {
            let at = usize::from(s) * SECTOR_SIZE;
            self.cache_dev.read_at(
                Sector(line_start.0 + u64::from(s)),
                &mut buf[at..at + SECTOR_SIZE],
            )?;
        }
        Ok(())
    }

    // -- lookup and cursor --------------------------------------------------

    /// Index lookup; a hit takes an inflight reference on the owning
    /// segment which the caller must drop on every path.
    fn cache_lookup(
        &self,
        staging: &Staging,
        key: Sector,
        write: bool,
        fullsize: bool,
    ) -> Option<Found> {
        let head = staging.index.head_of(key);
        let found = staging.index.lookup(head, key, &self.mbs).map(|idx| {
            let seg_slot = self.geo.seg_of_slot(idx);
            self.segments[seg_slot as usize].inc_inflight();
            Found {
                idx,
                seg_slot,
                on_buffer: seg_slot == staging.current_slot,
            }
        });
        self.stats.record(
            write,
            found.is_some(),
            found.is_some_and(|f| f.on_buffer),
            fullsize,
        );
        found
    }

    pub(crate) fn dec_inflight(&self, seg_slot: u64) {
        if self.segments[seg_slot as usize].dec_inflight() {
            self.inflight_gate.notify_all();
        }
    }

    fn wait_inflight_drain(&self, seg_slot: u64) {
        let seg = &self.segments[seg_slot as usize];
        self.inflight_gate.wait_until(|| seg.inflight() == 0);
    }

    /// Hand out the next write slot: bump the cursor and the current
    /// segment's length, and take an inflight reference for the caller.
    pub(crate) fn advance_cursor(&self, staging: &mut Staging) -> CacheSlot {
        if staging.cursor == self.geo.nr_caches() {
            staging.cursor = 0;
        }
        let old = staging.cursor;
        staging.cursor += 1;
        let seg = &self.segments[staging.current_slot as usize];
        let new_len = seg.bump_length();
        assert!(
            new_len <= self.geo.caches_per_seg(),
            "segment {} overfilled to {new_len}",
            seg.id()
        );
        seg.inc_inflight();
        let idx = CacheSlot(old);
        self.mbs[old as usize].reset_for_write();
        idx
    }

    fn needs_new_segment(&self, staging: &Staging) -> bool {
        self.segments[staging.current_slot as usize].length() == self.geo.caches_per_seg()
    }

    pub(crate) fn might_queue_current_buffer(&self, staging: &mut Staging) -> Result<()> {
        if self.needs_new_segment(staging) {
            self.queue_current_buffer(staging)?;
        }
        Ok(())
    }

    /// Hand the current RAM buffer to the flusher and make the next segment
    /// current.
    fn queue_current_buffer(&self, staging: &mut Staging) -> Result<()> {
        let slot = staging.current_slot;
        let seg = &self.segments[slot as usize];
        let id = seg.id();
        let length = seg.length();

        // Every writer that took a slot in this segment must have staged
        // its bytes before the header is built.
        self.wait_inflight_drain(slot);

        let rambuf = self.rambuf_for(id);
        {
            let mut buf = rambuf.lock();
            let start_idx = seg.start_idx().0;
            let records = (0..length).map(|i| {
                let mb = &self.mbs[(start_idx + i) as usize];
                let d = mb.read_dirtiness();
                let bits = if d.is_dirty { d.data_bits } else { SectorMask::EMPTY };
                (mb.key(), bits)
            });
            ondisk::encode_segment_header(buf.as_mut_slice(), self.geo, id, length, records);
        }

        let barriers = self.take_barriers();
        debug!(
            target: "wbc::segment",
            id = id.0,
            length,
            barriers = barriers.len(),
            "segment_handed_off"
        );
        self.flush_queue.push(FlushJob {
            id,
            start_sector: seg.start_sector(),
            length,
            rambuf,
            barriers,
        });

        self.acquire_new_segment(staging, id.next())?;
        staging.cursor = self.segments[staging.current_slot as usize].start_idx().0;
        Ok(())
    }

    /// Establish segment `id` as current: wait for its RAM buffer and ring
    /// slot to be reusable, then detach every line the slot still owns.
    fn acquire_new_segment(&self, staging: &mut Staging, id: SegmentId) -> Result<()> {
        // RAM buffer readiness: the segment that used this buffer
        // `nr_rambuf` ago must have finished flushing.
        self.flushed.wait_for(id.back(self.opts.nr_rambuf as u64).0)?;
        // Data slots are fully covered by their sector masks; only the
        // header slot needs a clean state.
        self.rambuf_for(id).lock().as_mut_slice()[..BLOCK_SIZE].fill(0);

        let slot = self.geo.slot_of_id(id);
        let seg = &self.segments[slot as usize];
        self.wait_inflight_drain(slot);

        // Ring readiness: the previous occupant of this slot must be on the
        // backing device before its bytes are overwritten.
        let wb_target = id.back(self.geo.nr_segments()).0;
        if self.written_back.current() < wb_target {
            self.urge_writeback.store(true, Ordering::Release);
            self.writeback_gate.notify_all();
            let waited = self.written_back.wait_for(wb_target);
            self.urge_writeback.store(false, Ordering::Release);
            waited?;
        }

        let start = seg.start_idx().0;
        for i in 0..self.geo.caches_per_seg() {
            let idx = CacheSlot(start + i);
            assert!(
                !self.mbs[idx.0 as usize].read_dirtiness().is_dirty,
                "dirty cache line {idx} survived into reacquired segment {id}"
            );
            staging.index.delete(idx);
        }

        seg.set_id(id);
        seg.set_length(0);
        staging.current_slot = slot;
        trace!(target: "wbc::segment", id = id.0, slot, "segment_acquired");
        Ok(())
    }

    /// Flush out all transient data. Does nothing when the current segment
    /// is empty and no barriers are queued.
    pub fn flush_current_buffer(&self) -> Result<()> {
        let old_id = {
            let mut staging = self.staging.lock();
            let seg = &self.segments[staging.current_slot as usize];
            let has_barriers = !self.barriers.lock().bios.is_empty();
            if seg.length() == 0 && !has_barriers {
                return Ok(());
            }
            let old_id = seg.id();
            self.queue_current_buffer(&mut staging)?;
            old_id
        };
        self.flushed.wait_for(old_id.0)
    }

    // -- barriers -----------------------------------------------------------

    fn queue_barrier(&self, bio: Arc<Bio>) {
        let mut queue = self.barriers.lock();
        if queue.bios.is_empty() {
            queue.since = Some(Instant::now());
        }
        queue.bios.push(bio);
    }

    fn take_barriers(&self) -> Vec<Arc<Bio>> {
        let mut queue = self.barriers.lock();
        queue.since = None;
        std::mem::take(&mut queue.bios)
    }

    // -- RAM buffer addressing ----------------------------------------------

    fn rambuf_for(&self, id: SegmentId) -> Arc<PlMutex<AlignedBuf>> {
        debug_assert!(id.is_valid());
        let i = ((id.0 - 1) % self.opts.nr_rambuf as u64) as usize;
        Arc::clone(&self.rambufs[i])
    }

    pub(crate) fn current_rambuf(&self, staging: &Staging) -> Arc<PlMutex<AlignedBuf>> {
        self.rambuf_for(self.segments[staging.current_slot as usize].id())
    }

    /// Byte offset of cache line `idx` inside its segment's RAM buffer
    /// (block 0 is the header).
    pub(crate) fn rambuf_block_offset(&self, idx: CacheSlot) -> usize {
        (self.geo.idx_inseg(idx) as usize + 1) * BLOCK_SIZE
    }
}

// ---------------------------------------------------------------------------
// Sector-masked copies
// ---------------------------------------------------------------------------

/// Copy the sectors named by `copy` from `src` to `dst`, skipping those in
/// `protect`.
pub(crate) fn copy_masked(dst: &mut [u8], protect: SectorMask, src: &[u8], copy: SectorMask) {
    for s in copy.sectors() {
        if protect.contains(s) {
            continue;
        }
        let at = usize::from(s) * SECTOR_SIZE;
        dst[at..at + SECTOR_SIZE].copy_from_slice(&src[at..at + SECTOR_SIZE]);
    }
}

/// Overlay the sectors named by `bits` from a full line into the bio's
/// payload window.
pub(crate) fn overlay_payload(bio: &Bio, line: &[u8], bits: SectorMask) {
    let offset = bio.block_offset();
    let end = offset + bio.len_sectors();
    let mut payload = bio.payload();
    for s in bits.sectors() {
        if s < offset || s >= end {
            continue;
        }
        let src = usize::from(s) * SECTOR_SIZE;
        let dst = usize::from(s - offset) * SECTOR_SIZE;
        payload[dst..dst + SECTOR_SIZE].copy_from_slice(&line[src..src + SECTOR_SIZE]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wbc_block::MemSectorDevice;

    #[test]
    fn copy_masked_respects_protection() {
        let src = {
            let mut v = vec![0_u8; BLOCK_SIZE];
            for (i, chunk) in v.chunks_mut(SECTOR_SIZE).enumerate() {
                chunk.fill(i as u8 + 1);
            }
            v
        };
        let mut dst = vec![0_u8; BLOCK_SIZE];
        copy_masked(&mut dst, SectorMask(0b0000_0010), &src, SectorMask(0b0000_0111));
        assert_eq!(dst[0], 1); // sector 0 copied
        assert_eq!(dst[SECTOR_SIZE], 0); // sector 1 protected
        assert_eq!(dst[2 * SECTOR_SIZE], 3); // sector 2 copied
        assert_eq!(dst[3 * SECTOR_SIZE], 0); // sector 3 not in copy mask
    }

    #[test]
    fn overlay_respects_bio_window() {
        let mut line = vec![0_u8; BLOCK_SIZE];
        for (i, chunk) in line.chunks_mut(SECTOR_SIZE).enumerate() {
            chunk.fill(0x10 + i as u8);
        }
        // Bio covers sectors 2..6 of the line.
        let bio = Bio::read(Sector(10), 4);
        overlay_payload(&bio, &line, SectorMask(0b0011_1100));
        let payload = bio.payload();
        assert_eq!(payload[0], 0x12);
        assert_eq!(payload[SECTOR_SIZE], 0x13);
        assert_eq!(payload[3 * SECTOR_SIZE], 0x15);
    }

    #[test]
    fn stats_bucket_indexing() {
        let stats = Stats::default();
        stats.record(true, true, false, true); // write|hit|fullsize
        stats.record(false, false, false, false);
        let snap = stats.snapshot();
        assert_eq!(snap[(1 << STAT_WRITE) | (1 << STAT_HIT) | (1 << STAT_FULLSIZE)], 1);
        assert_eq!(snap[0], 1);
        assert_eq!(snap.iter().sum::<u64>(), 2);
        stats.clear();
        assert_eq!(stats.snapshot().iter().sum::<u64>(), 0);
    }

    // A minimal host pump for in-crate smoke tests; the integration suites
    // carry the full scenario coverage.
    fn pump(cache: &LogCache, backing: &MemSectorDevice, cache_dev: &MemSectorDevice, bio: &Arc<Bio>) -> i32 {
        match cache.map(bio) {
            MapOutcome::Submitted => bio.wait(),
            MapOutcome::Remapped(remap) => {
                let dev: &dyn SectorDevice = match remap.target {
                    DeviceRole::Backing => backing,
                    DeviceRole::Cache => cache_dev,
                };
                let result = match bio.kind() {
                    BioKind::Read => {
                        let mut payload = bio.payload();
                        dev.read_at(remap.sector, payload.as_mut_slice())
                    }
                    BioKind::Write => dev.write_at(remap.sector, bio.payload().as_slice()),
                    BioKind::Flush => Ok(()),
                };
                let errno = result.as_ref().err().map_or(0, CacheError::to_errno);
                cache.end_io(bio, errno);
                bio.complete(errno);
                bio.wait()
            }
        }
    }

    fn small_cache() -> (Arc<LogCache>, MemSectorDevice, MemSectorDevice) {
        let backing = MemSectorDevice::new(4096);
        let cache_dev = MemSectorDevice::new(64 * 9);
        format_cache(&cache_dev, 6).expect("format");
        let opts = CacheOptions {
            segment_size_order: 6,
            nr_rambuf: 4,
            nr_read_cache_cells: 4,
            ..CacheOptions::default()
        };
        let cache = LogCache::resume(
            Arc::new(backing.clone()),
            Arc::new(cache_dev.clone()),
            opts,
        )
        .expect("resume");
        (cache, backing, cache_dev)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (cache, backing, cache_dev) = small_cache();

        let payload = vec![0xA5_u8; BLOCK_SIZE];
        let write = Bio::write(Sector(0), &payload);
        assert_eq!(pump(&cache, &backing, &cache_dev, &write), 0);

        let read = Bio::read(Sector(0), 8);
        assert_eq!(pump(&cache, &backing, &cache_dev, &read), 0);
        assert_eq!(*read.payload(), payload);
        assert_eq!(cache.nr_dirty_caches(), 1);

        cache.shutdown();
    }

    #[test]
    fn read_after_flush_comes_from_cache_device() {
        let (cache, backing, cache_dev) = small_cache();

        let payload = vec![0x3C_u8; BLOCK_SIZE];
        let write = Bio::write(Sector(8), &payload);
        assert_eq!(pump(&cache, &backing, &cache_dev, &write), 0);
        cache.flush_current_buffer().expect("flush");

        let read = Bio::read(Sector(8), 8);
        assert_eq!(pump(&cache, &backing, &cache_dev, &read), 0);
        assert_eq!(*read.payload(), payload);

        cache.shutdown();
    }

    #[test]
    fn miss_remaps_to_backing() {
        let (cache, backing, cache_dev) = small_cache();
        backing.write_at(Sector(64), &vec![0x77_u8; BLOCK_SIZE]).expect("seed");

        let read = Bio::read(Sector(64), 8);
        assert_eq!(pump(&cache, &backing, &cache_dev, &read), 0);
        assert!(read.payload().iter().all(|b| *b == 0x77));

        cache.shutdown();
    }

    #[test]
    fn status_reports_geometry_and_counters() {
        let (cache, backing, cache_dev) = small_cache();
        let write = Bio::write(Sector(0), &vec![1_u8; BLOCK_SIZE]);
        assert_eq!(pump(&cache, &backing, &cache_dev, &write), 0);

        let status = cache.status();
        assert_eq!(status.nr_segments, 8);
        assert_eq!(status.nr_caches, 8 * 7);
        assert_eq!(status.current_segment_id, 1);
        assert_eq!(status.nr_dirty_caches, 1);
        assert_eq!(status.stat.iter().sum::<u64>(), 1);

        cache.shutdown();
    }
}
