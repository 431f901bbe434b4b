#![forbid(unsafe_code)]
//! Shared newtypes and geometry math for the wbcache workspace.
//!
//! Everything here is pure arithmetic: sector addressing, per-sector bit
//! masks, and the segment geometry derived from the cache-device size and
//! the configured segment order.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// log2 of the sector size in bytes.
pub const SECTOR_SHIFT: u32 = 9;
/// Sector size in bytes (512).
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;
/// log2 of the cache-line size in sectors.
pub const BLOCK_SECTORS_SHIFT: u32 = 3;
/// Cache-line size in sectors (8).
pub const BLOCK_SECTORS: u8 = 1 << BLOCK_SECTORS_SHIFT;
/// Cache-line size in bytes (4 KiB).
pub const BLOCK_SIZE: usize = SECTOR_SIZE * BLOCK_SECTORS as usize;

/// Minimum supported segment size exponent (sectors = `1 << order`).
pub const MIN_SEGMENT_ORDER: u8 = 4;
/// Maximum supported segment size exponent.
///
/// Bounded so the on-disk segment header (16-byte records, one per cache
/// line) fits in a single 4 KiB block: at order 11 the header occupies
/// exactly `16 + 255 * 16 = 4096` bytes.
pub const MAX_SEGMENT_ORDER: u8 = 11;

/// A 512-byte sector address on either device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

impl Sector {
    /// Align down to the containing 4 KiB cache-line boundary.
    #[must_use]
    pub fn align_to_block(self) -> Sector {
        Sector(self.0 & !u64::from(BLOCK_SECTORS - 1))
    }

    /// Offset (0..8) of this sector within its cache line.
    #[must_use]
    pub fn block_offset(self) -> u8 {
        (self.0 & u64::from(BLOCK_SECTORS - 1)) as u8
    }

    /// Whether this sector starts a cache line.
    #[must_use]
    pub fn is_block_aligned(self) -> bool {
        self.block_offset() == 0
    }

    /// Byte offset of this sector on a byte-addressed medium.
    #[must_use]
    pub fn to_bytes(self) -> u64 {
        self.0 << SECTOR_SHIFT
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic segment identity. Zero denotes "invalid / never written".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub const INVALID: SegmentId = SegmentId(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The id `n` segments back, clamped at zero.
    ///
    /// Waiting on id zero is trivially satisfied, which makes the clamp the
    /// natural "no predecessor yet" encoding for ring-distance waits.
    #[must_use]
    pub fn back(self, n: u64) -> SegmentId {
        SegmentId(self.0.saturating_sub(n))
    }

    #[must_use]
    pub fn next(self) -> SegmentId {
        SegmentId(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense cache-line index, stable for the lifetime of the device.
///
/// A `u32` index bounds the cache at `4 KiB * 2^32` (16 TiB), mirroring the
/// addressing width of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheSlot(pub u32);

impl fmt::Display for CacheSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-sector bitmask over one cache line: bit `i` covers sector `i`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorMask(pub u8);

impl SectorMask {
    pub const EMPTY: SectorMask = SectorMask(0);
    pub const FULL: SectorMask = SectorMask(0xFF);

    /// Mask covering `count` sectors starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the span does not fit in one cache line.
    #[must_use]
    pub fn span(offset: u8, count: u8) -> SectorMask {
        assert!(
            offset < BLOCK_SECTORS && count <= BLOCK_SECTORS - offset,
            "sector span out of range: offset={offset} count={count}"
        );
        if count == BLOCK_SECTORS {
            return SectorMask::FULL;
        }
        SectorMask((((1_u16 << count) - 1) as u8) << offset)
    }

    #[must_use]
    pub fn contains(self, sector: u8) -> bool {
        self.0 & (1 << sector) != 0
    }

    #[must_use]
    pub fn is_full(self) -> bool {
        self.0 == 0xFF
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn union(self, other: SectorMask) -> SectorMask {
        SectorMask(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: SectorMask) -> SectorMask {
        SectorMask(self.0 & !other.0)
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the set sector offsets in ascending order.
    pub fn sectors(self) -> impl Iterator<Item = u8> {
        (0..BLOCK_SECTORS).filter(move |i| self.contains(*i))
    }
}

impl fmt::Display for SectorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("segment_size_order {0} out of range {MIN_SEGMENT_ORDER}..={MAX_SEGMENT_ORDER}")]
    InvalidOrder(u8),
    #[error("cache device too small: {device_sectors} sectors, need at least two segments of {segment_sectors}")]
    DeviceTooSmall {
        device_sectors: u64,
        segment_sectors: u64,
    },
    #[error("cache line population overflows u32: nr_segments={nr_segments} caches_per_seg={caches_per_seg}")]
    TooManyCaches {
        nr_segments: u64,
        caches_per_seg: u32,
    },
}

/// Fixed geometry of a cache device: segment size and segment count.
///
/// Region 0 of the device (one segment size) holds the superblock; segments
/// occupy regions 1 onward. Within a segment the first 4 KiB block is the
/// on-disk header and the remaining blocks are cache lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    segment_size_order: u8,
    nr_segments: u64,
}

impl Geometry {
    pub fn new(segment_size_order: u8, nr_segments: u64) -> Result<Geometry, GeometryError> {
        if !(MIN_SEGMENT_ORDER..=MAX_SEGMENT_ORDER).contains(&segment_size_order) {
            return Err(GeometryError::InvalidOrder(segment_size_order));
        }
        let geo = Geometry {
            segment_size_order,
            nr_segments,
        };
        if nr_segments == 0 {
            return Err(GeometryError::DeviceTooSmall {
                device_sectors: geo.segment_size_sectors(),
                segment_sectors: geo.segment_size_sectors(),
            });
        }
        let caches = nr_segments.checked_mul(u64::from(geo.caches_per_seg()));
        match caches {
            Some(n) if u32::try_from(n).is_ok() => Ok(geo),
            _ => Err(GeometryError::TooManyCaches {
                nr_segments,
                caches_per_seg: geo.caches_per_seg(),
            }),
        }
    }

    /// Derive the geometry from a device size: one superblock region plus as
    /// many whole segments as fit.
    pub fn from_device(
        segment_size_order: u8,
        device_sectors: u64,
    ) -> Result<Geometry, GeometryError> {
        if !(MIN_SEGMENT_ORDER..=MAX_SEGMENT_ORDER).contains(&segment_size_order) {
            return Err(GeometryError::InvalidOrder(segment_size_order));
        }
        let segment_sectors = 1_u64 << segment_size_order;
        let regions = device_sectors / segment_sectors;
        if regions < 2 {
            return Err(GeometryError::DeviceTooSmall {
                device_sectors,
                segment_sectors,
            });
        }
        Geometry::new(segment_size_order, regions - 1)
    }

    #[must_use]
    pub fn segment_size_order(self) -> u8 {
        self.segment_size_order
    }

    #[must_use]
    pub fn segment_size_sectors(self) -> u64 {
        1 << self.segment_size_order
    }

    #[must_use]
    pub fn nr_segments(self) -> u64 {
        self.nr_segments
    }

    /// Cache lines per segment: one block of every segment is the header.
    #[must_use]
    pub fn caches_per_seg(self) -> u32 {
        (1 << (self.segment_size_order - BLOCK_SECTORS_SHIFT as u8)) - 1
    }

    /// Total cache-line population.
    #[must_use]
    pub fn nr_caches(self) -> u32 {
        // Checked in the constructor.
        (self.nr_segments * u64::from(self.caches_per_seg())) as u32
    }

    /// Hash-table bucket count, proportional to the cache population.
    #[must_use]
    pub fn htsize(self) -> u32 {
        self.nr_caches().max(1)
    }

    /// Ring slot (0-based) occupied by segment `id`.
    #[must_use]
    pub fn slot_of_id(self, id: SegmentId) -> u64 {
        debug_assert!(id.is_valid());
        (id.0 - 1) % self.nr_segments
    }

    /// Lap counter for segment `id`: increments every full ring traversal.
    #[must_use]
    pub fn lap_of_id(self, id: SegmentId) -> u32 {
        debug_assert!(id.is_valid());
        (((id.0 - 1) / self.nr_segments) + 1) as u32
    }

    /// First device sector of the segment in ring slot `slot`.
    #[must_use]
    pub fn segment_start_sector(self, slot: u64) -> Sector {
        Sector((slot + 1) * self.segment_size_sectors())
    }

    /// Device sector of the superblock record (last sector of region 0).
    #[must_use]
    pub fn superblock_record_sector(self) -> Sector {
        Sector(self.segment_size_sectors() - 1)
    }

    /// Ring slot owning cache line `idx`.
    #[must_use]
    pub fn seg_of_slot(self, idx: CacheSlot) -> u64 {
        u64::from(idx.0) / u64::from(self.caches_per_seg())
    }

    /// Position of cache line `idx` within its segment.
    #[must_use]
    pub fn idx_inseg(self, idx: CacheSlot) -> u32 {
        idx.0 % self.caches_per_seg()
    }

    /// First cache line of the segment in ring slot `slot`.
    #[must_use]
    pub fn first_slot_of_seg(self, slot: u64) -> CacheSlot {
        CacheSlot((slot * u64::from(self.caches_per_seg())) as u32)
    }

    /// First device sector of the cache line `idx` (header block skipped).
    #[must_use]
    pub fn mb_start_sector(self, idx: CacheSlot) -> Sector {
        let seg_start = self.segment_start_sector(self.seg_of_slot(idx));
        Sector(seg_start.0 + u64::from(self.idx_inseg(idx) + 1) * u64::from(BLOCK_SECTORS))
    }

    /// Total sectors the layout occupies (superblock + segments).
    #[must_use]
    pub fn layout_sectors(self) -> u64 {
        (self.nr_segments + 1) * self.segment_size_sectors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_alignment() {
        assert_eq!(Sector(0).align_to_block(), Sector(0));
        assert_eq!(Sector(7).align_to_block(), Sector(0));
        assert_eq!(Sector(8).align_to_block(), Sector(8));
        assert_eq!(Sector(21).align_to_block(), Sector(16));
        assert_eq!(Sector(21).block_offset(), 5);
        assert!(Sector(16).is_block_aligned());
        assert!(!Sector(17).is_block_aligned());
    }

    #[test]
    fn mask_span_builds_expected_bits() {
        assert_eq!(SectorMask::span(0, 8), SectorMask::FULL);
        assert_eq!(SectorMask::span(0, 1), SectorMask(0b0000_0001));
        assert_eq!(SectorMask::span(7, 1), SectorMask(0b1000_0000));
        assert_eq!(SectorMask::span(2, 3), SectorMask(0b0001_1100));
        assert_eq!(SectorMask::span(0, 0), SectorMask::EMPTY);
    }

    #[test]
    #[should_panic(expected = "sector span out of range")]
    fn mask_span_rejects_overflow() {
        let _ = SectorMask::span(7, 2);
    }

    #[test]
    fn mask_set_operations() {
        let a = SectorMask(0b0000_1111);
        let b = SectorMask(0b0011_1100);
        assert_eq!(a.union(b), SectorMask(0b0011_1111));
        assert_eq!(b.difference(a), SectorMask(0b0011_0000));
        assert_eq!(a.count(), 4);
        assert!(a.contains(3));
        assert!(!a.contains(4));
        let sectors: Vec<u8> = SectorMask(0b1000_0001).sectors().collect();
        assert_eq!(sectors, vec![0, 7]);
    }

    #[test]
    fn segment_id_back_clamps_at_zero() {
        assert_eq!(SegmentId(10).back(3), SegmentId(7));
        assert_eq!(SegmentId(3).back(3), SegmentId(0));
        assert_eq!(SegmentId(2).back(64), SegmentId(0));
    }

    #[test]
    fn geometry_rejects_bad_order() {
        assert!(matches!(
            Geometry::new(12, 4),
            Err(GeometryError::InvalidOrder(12))
        ));
        assert!(matches!(
            Geometry::new(3, 4),
            Err(GeometryError::InvalidOrder(3))
        ));
    }

    #[test]
    fn geometry_from_device_reserves_superblock() {
        // 10 regions of 2^6 = 64 sectors: 1 superblock + 9 segments.
        let geo = Geometry::from_device(6, 64 * 10).expect("geometry");
        assert_eq!(geo.nr_segments(), 9);
        assert_eq!(geo.segment_size_sectors(), 64);
        assert_eq!(geo.caches_per_seg(), 7);
        assert_eq!(geo.nr_caches(), 63);

        // Trailing partial region is ignored.
        let geo = Geometry::from_device(6, 64 * 10 + 17).expect("geometry");
        assert_eq!(geo.nr_segments(), 9);

        assert!(matches!(
            Geometry::from_device(6, 64),
            Err(GeometryError::DeviceTooSmall { .. })
        ));
    }

    #[test]
    fn geometry_ring_math() {
        let geo = Geometry::new(6, 4).expect("geometry");
        // ids are 1-based; slots 0-based.
        assert_eq!(geo.slot_of_id(SegmentId(1)), 0);
        assert_eq!(geo.slot_of_id(SegmentId(4)), 3);
        assert_eq!(geo.slot_of_id(SegmentId(5)), 0);
        assert_eq!(geo.lap_of_id(SegmentId(1)), 1);
        assert_eq!(geo.lap_of_id(SegmentId(4)), 1);
        assert_eq!(geo.lap_of_id(SegmentId(5)), 2);
        assert_eq!(geo.lap_of_id(SegmentId(9)), 3);
    }

    #[test]
    fn geometry_sector_math() {
        let geo = Geometry::new(6, 4).expect("geometry");
        // Superblock occupies sectors 0..64; segment slot 0 starts at 64.
        assert_eq!(geo.segment_start_sector(0), Sector(64));
        assert_eq!(geo.segment_start_sector(3), Sector(256));
        assert_eq!(geo.superblock_record_sector(), Sector(63));

        // Cache line 0 lives after the slot-0 header block.
        assert_eq!(geo.mb_start_sector(CacheSlot(0)), Sector(64 + 8));
        assert_eq!(geo.mb_start_sector(CacheSlot(6)), Sector(64 + 7 * 8));
        // First line of slot 1.
        assert_eq!(geo.mb_start_sector(CacheSlot(7)), Sector(128 + 8));

        assert_eq!(geo.seg_of_slot(CacheSlot(6)), 0);
        assert_eq!(geo.seg_of_slot(CacheSlot(7)), 1);
        assert_eq!(geo.idx_inseg(CacheSlot(8)), 1);
        assert_eq!(geo.first_slot_of_seg(2), CacheSlot(14));
        assert_eq!(geo.layout_sectors(), 64 * 5);
    }

    #[test]
    fn max_order_header_exactly_fills_block() {
        let geo = Geometry::new(MAX_SEGMENT_ORDER, 1).expect("geometry");
        assert_eq!(geo.caches_per_seg(), 255);
        // 16-byte record stride plus the 16-byte fixed prefix.
        assert_eq!(16 + 255 * 16, BLOCK_SIZE);
    }
}
