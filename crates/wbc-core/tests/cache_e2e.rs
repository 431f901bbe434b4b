//! End-to-end scenarios over in-memory devices: the host-pump harness
//! submits bios through `map`, performs remapped transfers, and reports
//! completions through `end_io`, the way a block layer would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wbc_block::{MemSectorDevice, SectorDevice};
use wbc_core::{Bio, BioKind, CacheOptions, DeviceRole, LogCache, MapOutcome, Remap, format_cache};
use wbc_error::CacheError;
use wbc_types::{BLOCK_SIZE, SECTOR_SIZE, Sector};

struct Harness {
    cache: Arc<LogCache>,
    backing: MemSectorDevice,
    cache_dev: MemSectorDevice,
}

impl Harness {
    fn new(opts: CacheOptions, backing_sectors: u64, cache_sectors: u64) -> Harness {
        let backing = MemSectorDevice::new(backing_sectors);
        let cache_dev = MemSectorDevice::new(cache_sectors);
        format_cache(&cache_dev, opts.segment_size_order).expect("format");
        let cache = LogCache::resume(
            Arc::new(backing.clone()),
            Arc::new(cache_dev.clone()),
            opts,
        )
        .expect("resume");
        Harness {
            cache,
            backing,
            cache_dev,
        }
    }

    /// Submit a bio and drive it to completion; returns the errno and the
    /// remap decision (None when the core consumed the request).
    fn submit(&self, bio: &Arc<Bio>) -> (i32, Option<Remap>) {
        match self.cache.map(bio) {
            MapOutcome::Submitted => (bio.wait(), None),
            MapOutcome::Remapped(remap) => {
                let dev: &dyn SectorDevice = match remap.target {
                    DeviceRole::Backing => &self.backing,
                    DeviceRole::Cache => &self.cache_dev,
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
                self.cache.end_io(bio, errno);
                bio.complete(errno);
                (bio.wait(), Some(remap))
            }
        }
    }

    fn write(&self, sector: u64, data: &[u8]) {
        let bio = Bio::write(Sector(sector), data);
        let (errno, _) = self.submit(&bio);
        assert_eq!(errno, 0, "write at sector {sector} failed");
    }

    fn read(&self, sector: u64, len_sectors: u8) -> (Vec<u8>, Option<Remap>) {
        let bio = Bio::read(Sector(sector), len_sectors);
        let (errno, remap) = self.submit(&bio);
        assert_eq!(errno, 0, "read at sector {sector} failed");
        let data = bio.payload().clone();
        (data, remap)
    }
}

fn block_payload(seed: u8) -> Vec<u8> {
    let mut out = vec![seed; BLOCK_SIZE];
    for (i, chunk) in out.chunks_mut(SECTOR_SIZE).enumerate() {
        chunk[0] = i as u8;
    }
    out
}

fn small_opts() -> CacheOptions {
    CacheOptions {
        segment_size_order: 6,
        nr_rambuf: 4,
        nr_read_cache_cells: 4,
        ..CacheOptions::default()
    }
}

fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[test]
fn scenario_full_write_full_read() {
    // Full-size segments and the default RAM buffer ring, per the
    // reference configuration.
    let opts = CacheOptions {
        segment_size_order: 11,
        nr_rambuf: 64,
        ..CacheOptions::default()
    };
    let h = Harness::new(opts, 8192, 2048 * 5);

    let payload = block_payload(0xA5);
    h.write(0, &payload);
    let (data, remap) = h.read(0, 8);
    assert_eq!(data, payload);
    assert!(remap.is_none(), "hit must be served by the core");

    h.cache.flush_current_buffer().expect("flush");
    let (data, remap) = h.read(0, 8);
    assert_eq!(data, payload);
    // After the flush the full line is remapped straight to the cache
    // device.
    assert_eq!(remap.map(|r| r.target), Some(DeviceRole::Cache));

    h.cache.shutdown();
}

#[test]
fn scenario_partial_overwrite_merge() {
    // Writeback engages only when forced, so dirtiness accounting is
    // deterministic here.
    let h = Harness::new(
        CacheOptions {
            writeback_threshold: 100,
            ..small_opts()
        },
        4096,
        64 * 9,
    );

    let a = vec![0xFF_u8; BLOCK_SIZE];
    h.write(0, &a);
    h.cache.flush_current_buffer().expect("flush");
    assert_eq!(h.cache.nr_dirty_caches(), 1);

    // Overwrite sectors 0..4; the old line's sectors 4..8 merge forward.
    let b = vec![0xBB_u8; 4 * SECTOR_SIZE];
    h.write(0, &b);
    assert_eq!(
        h.cache.nr_dirty_caches(),
        1,
        "old line cleaned, new line tainted"
    );

    let (data, remap) = h.read(0, 8);
    assert!(remap.is_none(), "merged line is on the RAM buffer");
    assert_eq!(&data[..4 * SECTOR_SIZE], b.as_slice());
    assert_eq!(&data[4 * SECTOR_SIZE..], &a[4 * SECTOR_SIZE..]);

    h.cache.shutdown();
}

#[test]
fn scenario_write_around_invalidation() {
    let h = Harness::new(
        CacheOptions {
            write_around_mode: true,
            ..small_opts()
        },
        4096,
        64 * 9,
    );

    let c = block_payload(0xC3);
    let bio = Bio::write(Sector(0), &c);
    let (errno, remap) = h.submit(&bio);
    assert_eq!(errno, 0);
    assert_eq!(
        remap.map(|r| (r.target, r.sector)),
        Some((DeviceRole::Backing, Sector(0)))
    );

    let (data, remap) = h.read(0, 8);
    assert_eq!(remap.map(|r| r.target), Some(DeviceRole::Backing));
    assert_eq!(data, c);
    assert_eq!(h.cache.nr_dirty_caches(), 0);

    h.cache.shutdown();
}

#[test]
fn scenario_read_cache_sequential_skip() {
    let h = Harness::new(
        CacheOptions {
            read_cache_threshold: 4,
            nr_read_cache_cells: 6,
            ..small_opts()
        },
        4096,
        64 * 9,
    );
    for sector in [0_u64, 8, 16, 24, 32, 40] {
        h.backing
            .write_at(Sector(sector), &block_payload(sector as u8))
            .expect("seed backing");
    }

    // A 6-block sequential scan; every cell is reserved, then cancelled.
    for sector in [0_u64, 8, 16, 24, 32, 40] {
        let (_, remap) = h.read(sector, 8);
        assert_eq!(remap.map(|r| r.target), Some(DeviceRole::Backing));
    }

    // Give the batch worker time to run (it has nothing to promote).
    std::thread::sleep(Duration::from_millis(300));
    let (_, remap) = h.read(0, 8);
    assert_eq!(
        remap.map(|r| r.target),
        Some(DeviceRole::Backing),
        "sequential run must not be promoted"
    );

    h.cache.shutdown();
}

#[test]
fn read_cache_promotes_scattered_misses() {
    let h = Harness::new(
        CacheOptions {
            read_cache_threshold: 4,
            nr_read_cache_cells: 4,
            ..small_opts()
        },
        4096,
        64 * 9,
    );
    let sectors = [0_u64, 80, 400, 1000];
    for &sector in &sectors {
        h.backing
            .write_at(Sector(sector), &block_payload(sector as u8))
            .expect("seed backing");
    }

    for &sector in &sectors {
        let (_, remap) = h.read(sector, 8);
        assert_eq!(remap.map(|r| r.target), Some(DeviceRole::Backing));
    }

    // Promotion happens in the background once the batch completes.
    assert!(
        wait_until(Duration::from_secs(2), || {
            let bio = Bio::read(Sector(0), 8);
            let (errno, remap) = h.submit(&bio);
            assert_eq!(errno, 0);
            remap.is_none() || remap.map(|r| r.target) == Some(DeviceRole::Cache)
        }),
        "scattered miss was never promoted"
    );

    // Promoted lines are clean.
    assert_eq!(h.cache.nr_dirty_caches(), 0);
    let (data, _) = h.read(80, 8);
    assert_eq!(data, block_payload(80));

    h.cache.shutdown();
}

#[test]
fn partial_write_law_over_unknown_backing() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);
    let backing_block = block_payload(0x42);
    h.backing
        .write_at(Sector(16), &backing_block)
        .expect("seed backing");

    // Write sectors 2..5 of the block at sector 16.
    let p = vec![0xEE_u8; 3 * SECTOR_SIZE];
    h.write(18, &p);

    let (data, _) = h.read(16, 8);
    assert_eq!(&data[..2 * SECTOR_SIZE], &backing_block[..2 * SECTOR_SIZE]);
    assert_eq!(&data[2 * SECTOR_SIZE..5 * SECTOR_SIZE], p.as_slice());
    assert_eq!(&data[5 * SECTOR_SIZE..], &backing_block[5 * SECTOR_SIZE..]);

    h.cache.shutdown();
}

#[test]
fn boundary_bios_within_one_line() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);
    let backing_block = block_payload(0x10);
    h.backing
        .write_at(Sector(8), &backing_block)
        .expect("seed backing");

    // Single sector at offset 7.
    let tail = vec![0x99_u8; SECTOR_SIZE];
    h.write(15, &tail);
    let (data, _) = h.read(15, 1);
    assert_eq!(data, tail);

    // Single sector at offset 0.
    let head = vec![0x77_u8; SECTOR_SIZE];
    h.write(8, &head);
    let (data, _) = h.read(8, 1);
    assert_eq!(data, head);

    // Full block read merges both with untouched backing sectors.
    let (data, _) = h.read(8, 8);
    assert_eq!(&data[..SECTOR_SIZE], head.as_slice());
    assert_eq!(
        &data[SECTOR_SIZE..7 * SECTOR_SIZE],
        &backing_block[SECTOR_SIZE..7 * SECTOR_SIZE]
    );
    assert_eq!(&data[7 * SECTOR_SIZE..], tail.as_slice());

    h.cache.shutdown();
}

#[test]
fn fua_write_is_acknowledged_after_durability() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);

    let payload = block_payload(0x5C);
    let bio = Bio::write_fua(Sector(0), &payload);
    let (errno, remap) = h.submit(&bio);
    assert_eq!(errno, 0);
    assert!(remap.is_none());

    // The acknowledgement implies the staging segment was flushed.
    assert!(h.cache.last_flushed_id() >= 1);
    let (data, _) = h.read(0, 8);
    assert_eq!(data, payload);

    h.cache.shutdown();
}

#[test]
fn flush_bio_orders_after_prior_writes() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);

    h.write(0, &block_payload(0xAA));
    h.write(8, &block_payload(0xBB));

    let flush = Bio::flush();
    let (errno, remap) = h.submit(&flush);
    assert_eq!(errno, 0);
    assert!(remap.is_none());
    assert!(
        h.cache.last_flushed_id() >= 1,
        "barrier acknowledged before its segment was durable"
    );

    h.cache.shutdown();
}

#[test]
fn scenario_segment_handoff_at_boundary() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);
    let caches_per_seg = h.cache.geometry().caches_per_seg() as u64;

    // Exactly one hand-off happens at the segment boundary.
    for i in 0..=caches_per_seg {
        h.write(i * 8, &block_payload(i as u8));
    }
    let status = h.cache.status();
    assert_eq!(status.current_segment_id, 2);
    assert!(wait_until(Duration::from_secs(2), || {
        h.cache.last_flushed_id() == 1
    }));

    h.cache.shutdown();
}

#[test]
fn sustained_writes_roll_the_whole_ring() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);
    let nr_keys = 200_u64;

    let mut checksums = HashMap::new();
    for i in 0..nr_keys {
        let payload = block_payload((i % 251) as u8);
        checksums.insert(i * 8, blake3::hash(&payload).to_hex().to_string());
        h.write(i * 8, &payload);
    }

    // Every key reads back correctly whether it is still cached, written
    // back, or both.
    for i in 0..nr_keys {
        let (data, _) = h.read(i * 8, 8);
        assert_eq!(
            blake3::hash(&data).to_hex().to_string(),
            checksums[&(i * 8)],
            "key at sector {} corrupted",
            i * 8
        );
    }

    let status = h.cache.status();
    assert!(status.current_segment_id > status.nr_segments);
    h.cache.shutdown();
}

#[test]
fn concurrent_writers_are_serialized_by_key() {
    let h = Arc::new(Harness::new(small_opts(), 8192, 64 * 9));
    let nr_threads = 4_u64;
    let per_thread = 25_u64;

    let barrier = Arc::new(std::sync::Barrier::new(nr_threads as usize));
    let mut handles = Vec::new();
    for t in 0..nr_threads {
        let h = Arc::clone(&h);
        let barrier = Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..per_thread {
                let key = (t * per_thread + i) * 8;
                h.write(key, &block_payload((key % 255) as u8));
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no panic");
    }

    for key in (0..nr_threads * per_thread).map(|i| i * 8) {
        let (data, _) = h.read(key, 8);
        assert_eq!(data, block_payload((key % 255) as u8));
    }

    h.cache.shutdown();
}

#[test]
fn drop_caches_drains_all_dirty_lines() {
    let h = Harness::new(
        CacheOptions {
            // Writeback only engages when forced, so the drain is
            // attributable to drop_caches.
            writeback_threshold: 100,
            ..small_opts()
        },
        4096,
        64 * 9,
    );

    let payload = block_payload(0xD7);
    h.write(0, &payload);
    h.write(8, &payload);
    assert_eq!(h.cache.nr_dirty_caches(), 2);

    h.cache.message(&["drop_caches"]).expect("drop_caches");
    assert_eq!(h.cache.nr_dirty_caches(), 0);

    // The drained bytes are on the backing device now.
    let mut backing = vec![0_u8; BLOCK_SIZE];
    h.backing.read_at(Sector(0), &mut backing).expect("read backing");
    assert_eq!(backing, payload);

    h.cache.shutdown();
}

#[test]
fn control_messages_reconfigure_and_reject() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);

    h.write(0, &block_payload(1));
    assert!(h.cache.status().stat.iter().sum::<u64>() > 0);
    h.cache.message(&["clear_stat"]).expect("clear_stat");
    assert_eq!(h.cache.status().stat.iter().sum::<u64>(), 0);

    h.cache
        .message(&["writeback_threshold", "70"])
        .expect("reconfigure");
    assert_eq!(h.cache.status().tunables.writeback_threshold, 70);

    assert!(h.cache.message(&["writeback_threshold", "200"]).is_err());
    assert!(h.cache.message(&["write_around_mode", "1"]).is_err());
    assert!(h.cache.message(&["bogus"]).is_err());

    h.cache.shutdown();
}

#[test]
fn stats_distinguish_hits_and_buffer_hits() {
    let h = Harness::new(small_opts(), 4096, 64 * 9);

    h.write(0, &block_payload(9));
    let _ = h.read(0, 8); // buffer hit
    h.cache.flush_current_buffer().expect("flush");
    let _ = h.read(0, 8); // flushed hit
    let _ = h.read(640, 8); // miss

    let stat = h.cache.status().stat;
    // write | fullsize, miss
    assert_eq!(stat[0b1001], 1);
    // read hit on buffer, fullsize
    assert_eq!(stat[0b1110], 1);
    // read hit off buffer, fullsize
    assert_eq!(stat[0b1010], 1);
    // read miss, fullsize
    assert_eq!(stat[0b1000], 1);

    h.cache.shutdown();
}
