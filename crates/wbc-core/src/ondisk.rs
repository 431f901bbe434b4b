//! On-disk layout of the cache device.
//!
//! Region 0 (one segment size) is the superblock: magic in the first
//! sector, the mutable writeback record in the last. Every following region
//! is a segment: one 4 KiB header block, then the cache-line blocks.
//!
//! The header's fixed prefix (id, length, lap) sits inside the first sector
//! so discovery survives torn header writes; per-line records carry their
//! own lap so a torn segment write cannot resurrect stale lines.

use wbc_block::SectorDevice;
use wbc_error::{CacheError, Result};
use wbc_types::{BLOCK_SIZE, Geometry, SECTOR_SIZE, Sector, SectorMask, SegmentId};

/// "WBst", little-endian on disk.
pub const SUPERBLOCK_MAGIC: u32 = 0x5742_7374;

const HEADER_ID_OFFSET: usize = 0;
const HEADER_LENGTH_OFFSET: usize = 8;
const HEADER_LAP_OFFSET: usize = 9;
const RECORDS_OFFSET: usize = 16;
const RECORD_STRIDE: usize = 16;
const RECORD_KEY_OFFSET: usize = 0;
const RECORD_DIRTY_OFFSET: usize = 8;
const RECORD_LAP_OFFSET: usize = 12;

fn read_le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_le_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn write_le_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_le_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// One recovered cache-line record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    pub index_in_seg: u32,
    pub key: Sector,
    pub dirty_bits: SectorMask,
}

/// A valid segment header found during the resume scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedSegment {
    pub slot: u64,
    pub id: SegmentId,
    pub length: u32,
    /// Dirty records only; clean lines are not recovered.
    pub records: Vec<ScannedRecord>,
}

/// Serialize a segment header into `block` (one 4 KiB buffer).
///
/// `records` yields `(key, dirty_bits)` for the first `length` lines of the
/// segment; clean lines are recorded with zero bits so recovery skips them.
pub fn encode_segment_header(
    block: &mut [u8],
    geo: Geometry,
    id: SegmentId,
    length: u32,
    records: impl Iterator<Item = (Sector, SectorMask)>,
) {
    debug_assert!(block.len() >= BLOCK_SIZE);
    debug_assert!(length <= geo.caches_per_seg());
    let lap = geo.lap_of_id(id);

    block[..BLOCK_SIZE].fill(0);
    write_le_u64(block, HEADER_ID_OFFSET, id.0);
    block[HEADER_LENGTH_OFFSET] = length as u8;
    write_le_u32(block, HEADER_LAP_OFFSET, lap);

    for (i, (key, dirty_bits)) in records.take(length as usize).enumerate() {
        let base = RECORDS_OFFSET + i * RECORD_STRIDE;
        write_le_u64(block, base + RECORD_KEY_OFFSET, key.0);
        block[base + RECORD_DIRTY_OFFSET] = dirty_bits.0;
        write_le_u32(block, base + RECORD_LAP_OFFSET, lap);
    }
}

/// Decode the header block read from ring slot `slot`.
///
/// Returns `None` for never-written or stale (wrong position / wrong lap)
/// headers. Structurally impossible values are reported as corruption.
pub fn decode_segment_header(
    block: &[u8],
    geo: Geometry,
    slot: u64,
) -> Result<Option<ScannedSegment>> {
    let id = SegmentId(read_le_u64(block, HEADER_ID_OFFSET));
    if !id.is_valid() {
        return Ok(None);
    }
    if geo.slot_of_id(id) != slot || geo.lap_of_id(id) != read_le_u32(block, HEADER_LAP_OFFSET) {
        return Ok(None);
    }

    let length = u32::from(block[HEADER_LENGTH_OFFSET]);
    if length > geo.caches_per_seg() {
        return Err(CacheError::Corruption {
            sector: geo.segment_start_sector(slot).0,
            detail: format!("segment {id} header length {length} exceeds geometry"),
        });
    }

    let lap = geo.lap_of_id(id);
    let mut records = Vec::new();
    for i in 0..length {
        let base = RECORDS_OFFSET + i as usize * RECORD_STRIDE;
        if read_le_u32(block, base + RECORD_LAP_OFFSET) != lap {
            continue;
        }
        let dirty_bits = SectorMask(block[base + RECORD_DIRTY_OFFSET]);
        if dirty_bits.is_empty() {
            continue;
        }
        records.push(ScannedRecord {
            index_in_seg: i,
            key: Sector(read_le_u64(block, base + RECORD_KEY_OFFSET)),
            dirty_bits,
        });
    }

    Ok(Some(ScannedSegment {
        slot,
        id,
        length,
        records,
    }))
}

/// Read every segment header block, returning valid segments in ascending
/// id order.
pub fn scan_segments(dev: &dyn SectorDevice, geo: Geometry) -> Result<Vec<ScannedSegment>> {
    let mut block = vec![0_u8; BLOCK_SIZE];
    let mut found = Vec::new();
    for slot in 0..geo.nr_segments() {
        dev.read_at(geo.segment_start_sector(slot), &mut block)?;
        if let Some(scan) = decode_segment_header(&block, geo, slot)? {
            found.push(scan);
        }
    }
    found.sort_by_key(|s| s.id);
    tracing::debug!(
        target: "wbc::resume",
        segments_found = found.len(),
        max_id = found.last().map_or(0, |s| s.id.0),
        "segment_scan_complete"
    );
    Ok(found)
}

/// Check the superblock magic.
pub fn validate_superblock(dev: &dyn SectorDevice) -> Result<()> {
    let mut sector = vec![0_u8; SECTOR_SIZE];
    dev.read_at(Sector(0), &mut sector)?;
    let magic = read_le_u32(&sector, 0);
    if magic != SUPERBLOCK_MAGIC {
        return Err(CacheError::Format(format!(
            "bad superblock magic {magic:#010x}, expected {SUPERBLOCK_MAGIC:#010x}; format the cache device first"
        )));
    }
    Ok(())
}

/// Read the last-writeback id from the superblock record sector.
pub fn read_superblock_record(dev: &dyn SectorDevice, geo: Geometry) -> Result<u64> {
    let mut sector = vec![0_u8; SECTOR_SIZE];
    dev.read_at(geo.superblock_record_sector(), &mut sector)?;
    Ok(read_le_u64(&sector, 0))
}

/// Persist the last-writeback id into the superblock record sector.
///
/// `scratch` must be at least one sector; the caller supplies it so the
/// recorder daemon can draw from the bounded 512 B pool.
pub fn write_superblock_record(
    dev: &dyn SectorDevice,
    geo: Geometry,
    last_writeback_id: u64,
    scratch: &mut [u8],
) -> Result<()> {
    let sector = &mut scratch[..SECTOR_SIZE];
    sector.fill(0);
    write_le_u64(sector, 0, last_writeback_id);
    dev.write_at(geo.superblock_record_sector(), sector)?;
    dev.sync()
}

/// Initialize the cache device: superblock plus invalidated segment headers.
///
/// Destroys any previous cache contents.
pub fn format_cache(dev: &dyn SectorDevice, segment_size_order: u8) -> Result<Geometry> {
    let geo = Geometry::from_device(segment_size_order, dev.size_sectors())
        .map_err(|e| CacheError::Format(e.to_string()))?;

    let mut sector = vec![0_u8; SECTOR_SIZE];
    write_le_u32(&mut sector, 0, SUPERBLOCK_MAGIC);
    dev.write_at(Sector(0), &sector)?;

    sector.fill(0);
    dev.write_at(geo.superblock_record_sector(), &sector)?;

    let zero_block = vec![0_u8; BLOCK_SIZE];
    for slot in 0..geo.nr_segments() {
        dev.write_at(geo.segment_start_sector(slot), &zero_block)?;
    }
    dev.sync()?;

    tracing::info!(
        target: "wbc::resume",
        segment_size_order,
        nr_segments = geo.nr_segments(),
        nr_caches = geo.nr_caches(),
        "cache_device_formatted"
    );
    Ok(geo)
}
