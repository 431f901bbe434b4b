//! Cache options and runtime-tunable parameters.
//!
//! Static options are fixed at `resume`; tunables are adjustable afterwards
//! through key/value control messages, each validated against a bounded
//! range before taking effect.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use wbc_error::{CacheError, Result};
use wbc_types::{MAX_SEGMENT_ORDER, MIN_SEGMENT_ORDER};

/// Admissible range per tunable key.
const TUNABLE_RANGES: &[(&str, u64, u64)] = &[
    ("writeback_threshold", 0, 100),
    ("nr_max_batched_writeback", 1, 32),
    ("update_sb_record_interval", 0, 3600),
    ("sync_data_interval", 0, 3600),
    ("read_cache_threshold", 0, 127),
    ("barrier_deadline_ms", 1, 10_000),
];

/// Keys that exist but are fixed once the device is created.
const STATIC_KEYS: &[&str] = &[
    "write_around_mode",
    "nr_read_cache_cells",
    "segment_size_order",
    "nr_rambuf",
];

/// Full option set consumed by `LogCache::resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Segment size exponent over 512 B sectors (static).
    pub segment_size_order: u8,
    /// RAM buffer ring population (static).
    pub nr_rambuf: usize,
    /// Read-cache cell population (static).
    pub nr_read_cache_cells: u32,
    /// Bypass write caching entirely (static).
    pub write_around_mode: bool,

    /// Dirty percentage at which background writeback engages.
    pub writeback_threshold: u8,
    /// Maximum segments written back per batch.
    pub nr_max_batched_writeback: u32,
    /// Seconds between superblock record updates (0 = disabled).
    pub update_sb_record_interval: u64,
    /// Seconds between forced syncs of the current buffer (0 = disabled).
    pub sync_data_interval: u64,
    /// Sequential run length above which read misses are not promoted
    /// (0 = read promotion disabled).
    pub read_cache_threshold: u8,
    /// Upper bound on how long a queued barrier may wait for a hand-off.
    pub barrier_deadline_ms: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            segment_size_order: MAX_SEGMENT_ORDER,
            nr_rambuf: 64,
            nr_read_cache_cells: 2048,
            write_around_mode: false,
            writeback_threshold: 0,
            nr_max_batched_writeback: 1,
            update_sb_record_interval: 0,
            sync_data_interval: 0,
            read_cache_threshold: 0,
            barrier_deadline_ms: 10,
        }
    }
}

fn check_range(key: &str, value: u64) -> Result<()> {
    let (_, lo, hi) = TUNABLE_RANGES
        .iter()
        .find(|(name, _, _)| *name == key)
        .ok_or_else(|| CacheError::InvalidConfig(format!("unknown option {key}")))?;
    if !(*lo..=*hi).contains(&value) {
        return Err(CacheError::InvalidConfig(format!(
            "{key}={value} out of range {lo}..={hi}"
        )));
    }
    Ok(())
}

impl CacheOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SEGMENT_ORDER..=MAX_SEGMENT_ORDER).contains(&self.segment_size_order) {
            return Err(CacheError::InvalidConfig(format!(
                "segment_size_order={} out of range {MIN_SEGMENT_ORDER}..={MAX_SEGMENT_ORDER}",
                self.segment_size_order
            )));
        }
        if !(1..=2048).contains(&self.nr_rambuf) {
            return Err(CacheError::InvalidConfig(format!(
                "nr_rambuf={} out of range 1..=2048",
                self.nr_rambuf
            )));
        }
        if !(1..=2048).contains(&self.nr_read_cache_cells) {
            return Err(CacheError::InvalidConfig(format!(
                "nr_read_cache_cells={} out of range 1..=2048",
                self.nr_read_cache_cells
            )));
        }
        check_range("writeback_threshold", u64::from(self.writeback_threshold))?;
        check_range(
            "nr_max_batched_writeback",
            u64::from(self.nr_max_batched_writeback),
        )?;
        check_range("update_sb_record_interval", self.update_sb_record_interval)?;
        check_range("sync_data_interval", self.sync_data_interval)?;
        check_range("read_cache_threshold", u64::from(self.read_cache_threshold))?;
        check_range("barrier_deadline_ms", self.barrier_deadline_ms)?;
        Ok(())
    }
}

/// Point-in-time view of the tunable values, as reported by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableSnapshot {
    pub writeback_threshold: u8,
    pub nr_max_batched_writeback: u32,
    pub update_sb_record_interval: u64,
    pub sync_data_interval: u64,
    pub read_cache_threshold: u8,
    pub barrier_deadline_ms: u64,
}

/// Runtime-adjustable parameters, readable without locks from daemons and
/// the I/O paths.
#[derive(Debug)]
pub struct Tunables {
    writeback_threshold: AtomicU64,
    nr_max_batched_writeback: AtomicU64,
    update_sb_record_interval: AtomicU64,
    sync_data_interval: AtomicU64,
    read_cache_threshold: AtomicU64,
    barrier_deadline_ms: AtomicU64,
}

impl Tunables {
    #[must_use]
    pub fn new(opts: &CacheOptions) -> Self {
        Self {
            writeback_threshold: AtomicU64::new(u64::from(opts.writeback_threshold)),
            nr_max_batched_writeback: AtomicU64::new(u64::from(opts.nr_max_batched_writeback)),
            update_sb_record_interval: AtomicU64::new(opts.update_sb_record_interval),
            sync_data_interval: AtomicU64::new(opts.sync_data_interval),
            read_cache_threshold: AtomicU64::new(u64::from(opts.read_cache_threshold)),
            barrier_deadline_ms: AtomicU64::new(opts.barrier_deadline_ms),
        }
    }

    /// Apply `key = value`, rejecting unknown keys, static options, and
    /// out-of-range values without touching existing state.
    pub fn set(&self, key: &str, value: u64) -> Result<()> {
        if STATIC_KEYS.contains(&key) {
            return Err(CacheError::InvalidConfig(format!(
                "{key} is a static option"
            )));
        }
        check_range(key, value)?;
        let slot = match key {
            "writeback_threshold" => &self.writeback_threshold,
            "nr_max_batched_writeback" => &self.nr_max_batched_writeback,
            "update_sb_record_interval" => &self.update_sb_record_interval,
            "sync_data_interval" => &self.sync_data_interval,
            "read_cache_threshold" => &self.read_cache_threshold,
            "barrier_deadline_ms" => &self.barrier_deadline_ms,
            _ => unreachable!("key validated against the range table"),
        };
        slot.store(value, Ordering::Release);
        tracing::info!(target: "wbc::config", key, value, "tunable_updated");
        Ok(())
    }

    #[must_use]
    pub fn writeback_threshold(&self) -> u8 {
        self.writeback_threshold.load(Ordering::Acquire) as u8
    }

    #[must_use]
    pub fn nr_max_batched_writeback(&self) -> u32 {
        self.nr_max_batched_writeback.load(Ordering::Acquire) as u32
    }

    #[must_use]
    pub fn update_sb_record_interval(&self) -> u64 {
        self.update_sb_record_interval.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn sync_data_interval(&self) -> u64 {
        self.sync_data_interval.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn read_cache_threshold(&self) -> u8 {
        self.read_cache_threshold.load(Ordering::Acquire) as u8
    }

    #[must_use]
    pub fn barrier_deadline_ms(&self) -> u64 {
        self.barrier_deadline_ms.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn snapshot(&self) -> TunableSnapshot {
        TunableSnapshot {
            writeback_threshold: self.writeback_threshold(),
            nr_max_batched_writeback: self.nr_max_batched_writeback(),
            update_sb_record_interval: self.update_sb_record_interval(),
            sync_data_interval: self.sync_data_interval(),
            read_cache_threshold: self.read_cache_threshold(),
            barrier_deadline_ms: self.barrier_deadline_ms(),
        }
    }
}
