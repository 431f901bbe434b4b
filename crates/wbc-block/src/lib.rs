#![forbid(unsafe_code)]
//! Sector-addressed device layer for wbcache.
//!
//! Provides the `SectorDevice` trait with file-backed and in-memory
//! implementations, page-aligned owned buffers, and bounded scratch pools
//! whose exhaustion fails fast instead of blocking the I/O path.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use wbc_error::{CacheError, Result};
use wbc_types::{SECTOR_SHIFT, SECTOR_SIZE, Sector};

const PAGE_ALIGNMENT: usize = 4096;

/// Owned byte buffer whose exposed slice starts on a 4 KiB boundary.
///
/// Stays fully safe by over-allocating and exposing an aligned subslice of
/// the backing `Vec`.
#[derive(Debug, Clone)]
pub struct AlignedBuf {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    #[must_use]
    pub fn new(len: usize) -> Self {
        if len == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }
        let storage = vec![0_u8; len + PAGE_ALIGNMENT - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (PAGE_ALIGNMENT - 1);
        let start = if misalignment == 0 {
            0
        } else {
            PAGE_ALIGNMENT - misalignment
        };
        debug_assert!(start + len <= storage.len());
        Self {
            storage,
            start,
            len,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl PartialEq for AlignedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedBuf {}

fn check_range(sector: Sector, len_bytes: usize, size_sectors: u64) -> Result<u64> {
    if len_bytes % SECTOR_SIZE != 0 {
        return Err(CacheError::Format(format!(
            "I/O length {len_bytes} is not sector-granular"
        )));
    }
    let len_sectors = (len_bytes >> SECTOR_SHIFT) as u64;
    let end = sector
        .0
        .checked_add(len_sectors)
        .ok_or_else(|| CacheError::Format("I/O range overflows u64".to_owned()))?;
    if end > size_sectors {
        return Err(CacheError::Format(format!(
            "I/O out of bounds: sector={sector} len_sectors={len_sectors} device_sectors={size_sectors}"
        )));
    }
    Ok(len_sectors)
}

/// Sector-addressed device with positional read/write semantics.
///
/// Every transfer is a whole number of 512 B sectors. Implementations must
/// be safe for concurrent calls from multiple threads.
pub trait SectorDevice: Send + Sync {
    /// Device capacity in sectors.
    fn size_sectors(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `sector`.
    fn read_at(&self, sector: Sector, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at `sector`.
    fn write_at(&self, sector: Sector, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed sector device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileSectorDevice {
    file: Arc<File>,
    size_sectors: u64,
}

impl FileSectorDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            return Err(CacheError::Format(format!(
                "device length {len} is not sector-granular"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            size_sectors: len >> SECTOR_SHIFT,
        })
    }
}

impl SectorDevice for FileSectorDevice {
    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn read_at(&self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        check_range(sector, buf.len(), self.size_sectors)?;
        self.file.read_exact_at(buf, sector.to_bytes())?;
        Ok(())
    }

    fn write_at(&self, sector: Sector, buf: &[u8]) -> Result<()> {
        check_range(sector, buf.len(), self.size_sectors)?;
        self.file.write_all_at(buf, sector.to_bytes())?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Shared in-memory sector device.
///
/// Clones share the same storage, which lets a test or loopback deployment
/// re-open "the device" across cache instances the way a real block device
/// survives a target teardown.
#[derive(Debug, Clone)]
pub struct MemSectorDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    size_sectors: u64,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(size_sectors: u64) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; (size_sectors as usize) << 9])),
            size_sectors,
        }
    }

    /// Rebuild a device from a raw snapshot, e.g. to model the state a
    /// crash left behind.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is not sector-granular.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        assert!(
            bytes.len() % SECTOR_SIZE == 0,
            "snapshot length {} is not sector-granular",
            bytes.len()
        );
        let size_sectors = (bytes.len() >> SECTOR_SHIFT) as u64;
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            size_sectors,
        }
    }

    /// Snapshot the raw contents (test support).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl SectorDevice for MemSectorDevice {
    fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    fn read_at(&self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        check_range(sector, buf.len(), self.size_sectors)?;
        let start = sector.to_bytes() as usize;
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, sector: Sector, buf: &[u8]) -> Result<()> {
        check_range(sector, buf.len(), self.size_sectors)?;
        let start = sector.to_bytes() as usize;
        let mut bytes = self.bytes.lock();
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bounded scratch pools
// ---------------------------------------------------------------------------

/// Fixed-population pool of equally sized scratch buffers.
///
/// Allocation never blocks: an empty pool reports `OutOfMemory`, and the
/// caller fails the originating request instead of stalling the I/O path.
#[derive(Debug)]
pub struct ScratchPool {
    name: &'static str,
    buf_len: usize,
    free: Mutex<Vec<AlignedBuf>>,
}

impl ScratchPool {
    #[must_use]
    pub fn new(name: &'static str, buf_len: usize, population: usize) -> Arc<Self> {
        let free = (0..population).map(|_| AlignedBuf::new(buf_len)).collect();
        Arc::new(Self {
            name,
            buf_len,
            free: Mutex::new(free),
        })
    }

    /// Take a buffer from the pool.
    ///
    /// The buffer's previous contents are unspecified; callers fill before
    /// reading, as with a slab-backed mempool.
    pub fn try_alloc(self: &Arc<Self>) -> Result<ScratchBuf> {
        let buf = self.free.lock().pop();
        match buf {
            Some(buf) => Ok(ScratchBuf {
                buf: Some(buf),
                pool: Arc::clone(self),
            }),
            None => {
                trace!(
                    target: "wbc::block",
                    pool = self.name,
                    "scratch_pool_exhausted"
                );
                Err(CacheError::OutOfMemory(self.name))
            }
        }
    }

    #[must_use]
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, buf: AlignedBuf) {
        self.free.lock().push(buf);
    }
}

/// A pooled scratch buffer; returns to its pool on drop.
#[derive(Debug)]
pub struct ScratchBuf {
    buf: Option<AlignedBuf>,
    pool: Arc<ScratchPool>,
}

impl ScratchBuf {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().map_or(&[], AlignedBuf::as_slice)
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf
            .as_mut()
            .map_or(&mut [], AlignedBuf::as_mut_slice)
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
