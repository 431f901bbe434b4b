//! Flush pipeline: bounded job queue, single-writer flusher, and the
//! monotonic-id notifiers daemons and foreground waiters block on.
//!
//! Each job persists one segment's RAM buffer with a single write. A sync
//! is issued only when barrier bios ride the job; their acknowledgement is
//! the durability point for everything staged in segments up to the job's
//! id.

use crate::LogCache;
use crate::bio::Bio;
use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, PoisonError};
use tracing::{debug, error, warn};
use wbc_block::AlignedBuf;
use wbc_error::{CacheError, Result};
use wbc_types::{BLOCK_SIZE, Sector, SegmentId};

const FLUSH_MAX_RETRIES: u32 = 3;

/// One segment hand-off: the RAM buffer to persist plus the barriers that
/// must be released after it is durable.
pub(crate) struct FlushJob {
    pub id: SegmentId,
    pub start_sector: Sector,
    /// Committed cache lines at hand-off; only `length + 1` blocks are
    /// written.
    pub length: u32,
    pub rambuf: Arc<PlMutex<AlignedBuf>>,
    pub barriers: Vec<Arc<Bio>>,
}

/// Single-consumer job queue feeding the flusher thread.
///
/// Depth is naturally bounded by the RAM buffer ring: a segment cannot be
/// handed off until the buffer it reuses has finished flushing.
#[derive(Default)]
pub(crate) struct FlushQueue {
    inner: StdMutex<VecDeque<FlushJob>>,
    cv: Condvar,
    stopped: AtomicBool,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: FlushJob) {
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back(job);
        drop(queue);
        self.cv.notify_all();
    }

    /// Next job; `None` once stopped and drained.
    pub fn pop(&self) -> Option<FlushJob> {
        let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            queue = self.cv.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Monotonic id notifier
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct NotifierState {
    reached: u64,
    failed: Option<(u64, String)>,
}

/// Tracks a monotonically advancing segment id and wakes threads waiting
/// for it to reach a target (`last_flushed_id`, `last_writeback_id`).
///
/// A failure poisons all waits at or below the failed id so foreground
/// requests surface the error instead of blocking forever.
#[derive(Debug)]
pub struct IdNotifier {
    state: StdMutex<NotifierState>,
    cv: Condvar,
}

impl IdNotifier {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            state: StdMutex::new(NotifierState {
                reached: start,
                failed: None,
            }),
            cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reached
    }

    /// Advance to `id` (and wake waiters); ids never move backwards.
    pub fn advance(&self, id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if id > state.reached {
            state.reached = id;
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Record a failure at `id` and wake waiters.
    pub fn fail(&self, id: u64, detail: String) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.failed {
            Some((prev, _)) if *prev >= id => {}
            _ => state.failed = Some((id, detail)),
        }
        drop(state);
        self.cv.notify_all();
    }

    /// Block until the id reaches `id`, or a failure at or past it occurred.
    pub fn wait_for(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some((failed_id, detail)) = &state.failed {
                if id <= *failed_id {
                    return Err(CacheError::Io(std::io::Error::other(detail.clone())));
                }
            }
            if id <= state.reached {
                return Ok(());
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// ---------------------------------------------------------------------------
// Flusher
// ---------------------------------------------------------------------------

impl LogCache {
    /// Single-writer flusher: drains hand-offs in order, so segment `i` is
    /// always durable before segment `i + 1` starts flushing.
    pub(crate) fn flusher_loop(&self) {
        while let Some(job) = self.flush_queue.pop() {
            match self.flush_one(&job) {
                Ok(()) => {
                    self.flushed.advance(job.id.0);
                    if job.length < self.geo.caches_per_seg() {
                        self.stats.inc_non_full_flushed();
                    }
                    debug!(
                        target: "wbc::flush",
                        id = job.id.0,
                        length = job.length,
                        barriers = job.barriers.len(),
                        "segment_flushed"
                    );
                    for bio in &job.barriers {
                        bio.complete(0);
                    }
                    self.writeback_gate.notify_all();
                }
                Err(err) => {
                    error!(
                        target: "wbc::flush",
                        id = job.id.0,
                        error = %err,
                        "segment_flush_failed"
                    );
                    let errno = err.to_errno();
                    self.flushed.fail(job.id.0, err.to_string());
                    for bio in &job.barriers {
                        bio.complete(errno);
                    }
                }
            }
        }
    }

    fn flush_one(&self, job: &FlushJob) -> Result<()> {
        let buf = job.rambuf.lock();
        let bytes = (job.length as usize + 1) * BLOCK_SIZE;
        let data = &buf.as_slice()[..bytes];

        for attempt in 1..=FLUSH_MAX_RETRIES {
            let written = self.cache_dev.write_at(job.start_sector, data).and_then(|()| {
                if job.barriers.is_empty() {
                    Ok(())
                } else {
                    self.cache_dev.sync()
                }
            });
            match written {
                Ok(()) => return Ok(()),
                Err(err) if attempt == FLUSH_MAX_RETRIES => return Err(err),
                Err(err) => {
                    warn!(
                        target: "wbc::flush",
                        id = job.id.0,
                        attempt,
                        error = %err,
                        "segment_flush_retry"
                    );
                }
            }
        }
        unreachable!("flush retry loop returns on the final attempt")
    }
}
