//! Storage engine over a raw flash device
//!
//! [`OtaStorage`] owns the destination device for the length of an attempt.
//! It splits writes into bursts with the watchdog fed in between, skips
//! already-erased sectors when erasing, and streams CRC32 or SHA-256 over
//! flash contents for verification.
//!
//! # Erase strategy
//!
//! ```text
//!  offset                                                    offset + size
//!    | 4K 4K 4K | ------ 64K ------ | ------ 64K ------ | 4K 4K |
//!      head          full blocks (checked per sector)      tail
//! ```
//!
//! Every sector is read back and tested before anything is erased. A 64 KiB
//! block is erased with one block command only when all sixteen of its
//! sectors are dirty; otherwise just the dirty sectors are erased.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ota_crypto::{DIGEST_LEN, ImageVerifyingKey};
use ota_errors::{ImageError, OtaError, StorageError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace};

use crate::flash::{
    BLOCK_SIZE, ERASED_BYTE, FlashDevice, NoopSchedulerLock, NoopWatchdog, SECTOR_SIZE,
    SECTORS_PER_BLOCK, SchedulerGuard, SchedulerLock, Watchdog,
};
use crate::image::header::{HEAD_SIZE, IMAGE_MAGIC_BYTES, ImageHeader};

/// Default program burst.
pub const DEFAULT_WRITE_BURST: usize = 4 * 1024;

/// Default read chunk.
pub const DEFAULT_READ_SEGMENT: usize = 4 * 1024;

/// Timing and erase counters, for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Time spent reading sectors back before erasing
    pub erase_read: Duration,
    /// Time spent in 4 KiB erases
    pub erase_4k: Duration,
    /// Time spent in 64 KiB erases
    pub erase_64k: Duration,
    /// 4 KiB erases issued
    pub erase_4k_count: u32,
    /// 64 KiB erases issued
    pub erase_64k_count: u32,
    /// Clean 4 KiB sectors skipped
    pub skip_4k_count: u32,
    /// Clean 64 KiB blocks skipped
    pub skip_64k_count: u32,
    /// Time spent in reads
    pub read: Duration,
    /// Time spent in writes
    pub write: Duration,
    /// Time spent computing CRC32
    pub crc: Duration,
    /// Time spent computing SHA-256
    pub hash: Duration,
}

impl StorageStats {
    /// Log a one-line summary.
    pub fn log_summary(&self) {
        info!(
            erase_read_ms = self.erase_read.as_millis(),
            erase_4k_ms = self.erase_4k.as_millis(),
            erase_4k = self.erase_4k_count,
            skip_4k = self.skip_4k_count,
            erase_64k_ms = self.erase_64k.as_millis(),
            erase_64k = self.erase_64k_count,
            skip_64k = self.skip_64k_count,
            read_ms = self.read.as_millis(),
            write_ms = self.write.as_millis(),
            crc_ms = self.crc.as_millis(),
            hash_ms = self.hash.as_millis(),
            "storage statistics"
        );
    }
}

/// Storage engine bound to one flash device.
pub struct OtaStorage {
    device: Box<dyn FlashDevice>,
    storage_id: u8,
    max_write_burst: usize,
    read_segment: usize,
    watchdog: Box<dyn Watchdog>,
    scheduler: Arc<dyn SchedulerLock>,
    stats: StorageStats,
}

impl std::fmt::Debug for OtaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaStorage")
            .field("device", &self.device.name())
            .field("storage_id", &self.storage_id)
            .field("max_write_burst", &self.max_write_burst)
            .field("read_segment", &self.read_segment)
            .finish_non_exhaustive()
    }
}

impl OtaStorage {
    /// Bind to `device`. The storage id is 0 for the execute-in-place device
    /// and 1 for any other.
    pub fn new(device: Box<dyn FlashDevice>) -> Self {
        let storage_id = if device.is_xip() { 0 } else { 1 };
        info!(device = device.name(), storage_id, "storage bound");
        Self {
            device,
            storage_id,
            max_write_burst: DEFAULT_WRITE_BURST,
            read_segment: DEFAULT_READ_SEGMENT,
            watchdog: Box::new(NoopWatchdog),
            scheduler: Arc::new(NoopSchedulerLock),
            stats: StorageStats::default(),
        }
    }

    /// Set the program burst size. Zero keeps the current value.
    #[must_use]
    pub fn with_max_write_burst(mut self, burst: usize) -> Self {
        if burst > 0 {
            self.max_write_burst = burst;
        }
        self
    }

    /// Set the read chunk size. Zero keeps the current value.
    #[must_use]
    pub fn with_read_segment(mut self, segment: usize) -> Self {
        if segment > 0 {
            self.read_segment = segment;
        }
        self
    }

    /// Use `watchdog` between bursts.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Box<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Lock `scheduler` around erases of the execute-in-place device.
    #[must_use]
    pub fn with_scheduler_lock(mut self, scheduler: Arc<dyn SchedulerLock>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Storage id partitions are matched against.
    pub fn storage_id(&self) -> u8 {
        self.storage_id
    }

    /// Underlying device name.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Device capacity.
    pub fn capacity(&self) -> u32 {
        self.device.capacity()
    }

    /// Accumulated diagnostics.
    pub fn stats(&self) -> &StorageStats {
        &self.stats
    }

    /// Clear the diagnostic counters.
    pub fn reset_stats(&mut self) {
        self.stats = StorageStats::default();
    }

    /// Program `data` at `offset` in bursts of at most `max_write_burst`.
    ///
    /// # Errors
    ///
    /// Fails fast with the first burst error.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut addr = offset;
        for burst in data.chunks(self.max_write_burst) {
            self.watchdog.feed();
            self.device.write(addr, burst)?;
            addr = addr.wrapping_add(burst.len() as u32);
        }
        trace!(offset, len = data.len(), "flash write");
        self.stats.write = self.stats.write.saturating_add(start.elapsed());
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset` in `read_segment` chunks.
    ///
    /// # Errors
    ///
    /// Returns the first device read error.
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut addr = offset;
        for chunk in buf.chunks_mut(self.read_segment) {
            self.device.read(addr, chunk)?;
            addr = addr.wrapping_add(chunk.len() as u32);
        }
        self.stats.read = self.stats.read.saturating_add(start.elapsed());
        Ok(())
    }

    /// Whether `size` bytes at `offset` are all erased.
    ///
    /// # Errors
    ///
    /// Returns the first device read error.
    pub fn is_clean(&mut self, offset: u32, size: u32) -> Result<bool, StorageError> {
        let mut buf = vec![0u8; self.read_segment];
        let mut addr = offset;
        let mut remaining = size as usize;
        while remaining > 0 {
            let len = remaining.min(buf.len());
            let chunk = buf.get_mut(..len).unwrap_or_default();
            self.device.read(addr, chunk)?;
            if chunk.iter().any(|&b| b != ERASED_BYTE) {
                return Ok(false);
            }
            addr = addr.wrapping_add(len as u32);
            remaining = remaining.saturating_sub(len);
        }
        Ok(true)
    }

    /// Erase `[offset, offset + size)`, skipping sectors that are already clean.
    ///
    /// Both bounds must be aligned to [`SECTOR_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Misaligned`] for unaligned input, or the first
    /// device error.
    pub fn erase(&mut self, offset: u32, size: u32) -> Result<(), StorageError> {
        if offset % SECTOR_SIZE != 0 || size % SECTOR_SIZE != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len: size,
                align: SECTOR_SIZE,
            });
        }
        let end = offset
            .checked_add(size)
            .ok_or(StorageError::OutOfRange {
                offset,
                len: u64::from(size),
                capacity: self.device.capacity(),
            })?;
        debug!(offset, size, "erase");

        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        let mut pos = offset;

        while pos < end && pos % BLOCK_SIZE != 0 {
            self.erase_sector_if_dirty(pos, &mut sector)?;
            pos = pos.saturating_add(SECTOR_SIZE);
        }
        while end.saturating_sub(pos) >= BLOCK_SIZE {
            self.erase_block_if_dirty(pos, &mut sector)?;
            pos = pos.saturating_add(BLOCK_SIZE);
        }
        while pos < end {
            self.erase_sector_if_dirty(pos, &mut sector)?;
            pos = pos.saturating_add(SECTOR_SIZE);
        }
        Ok(())
    }

    /// Erase unconditionally, without reading back first.
    ///
    /// # Errors
    ///
    /// Returns the device error.
    pub fn erase_initial(&mut self, offset: u32, size: u32) -> Result<(), StorageError> {
        info!(offset, size, "initial erase");
        self.watchdog.feed();
        let start = Instant::now();
        self.device_erase(offset, size)?;
        self.stats.erase_4k = self.stats.erase_4k.saturating_add(start.elapsed());
        Ok(())
    }

    fn sector_is_dirty(&mut self, addr: u32, buf: &mut [u8]) -> Result<bool, StorageError> {
        let start = Instant::now();
        self.device.read(addr, buf)?;
        self.stats.erase_read = self.stats.erase_read.saturating_add(start.elapsed());
        Ok(buf.iter().any(|&b| b != ERASED_BYTE))
    }

    fn erase_sector_if_dirty(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.watchdog.feed();
        if self.sector_is_dirty(addr, buf)? {
            let start = Instant::now();
            self.device_erase(addr, SECTOR_SIZE)?;
            self.stats.erase_4k = self.stats.erase_4k.saturating_add(start.elapsed());
            self.stats.erase_4k_count = self.stats.erase_4k_count.saturating_add(1);
        } else {
            self.stats.skip_4k_count = self.stats.skip_4k_count.saturating_add(1);
        }
        Ok(())
    }

    fn erase_block_if_dirty(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.watchdog.feed();
        let mut dirty = [false; SECTORS_PER_BLOCK as usize];
        let mut sector_addr = addr;
        for flag in &mut dirty {
            *flag = self.sector_is_dirty(sector_addr, buf)?;
            sector_addr = sector_addr.saturating_add(SECTOR_SIZE);
        }

        if dirty.iter().all(|&d| d) {
            let start = Instant::now();
            self.device_erase(addr, BLOCK_SIZE)?;
            self.stats.erase_64k = self.stats.erase_64k.saturating_add(start.elapsed());
            self.stats.erase_64k_count = self.stats.erase_64k_count.saturating_add(1);
            return Ok(());
        }
        if !dirty.iter().any(|&d| d) {
            self.stats.skip_64k_count = self.stats.skip_64k_count.saturating_add(1);
            return Ok(());
        }

        let mut sector_addr = addr;
        for is_dirty in dirty {
            if is_dirty {
                self.watchdog.feed();
                let start = Instant::now();
                self.device_erase(sector_addr, SECTOR_SIZE)?;
                self.stats.erase_4k = self.stats.erase_4k.saturating_add(start.elapsed());
                self.stats.erase_4k_count = self.stats.erase_4k_count.saturating_add(1);
            } else {
                self.stats.skip_4k_count = self.stats.skip_4k_count.saturating_add(1);
            }
            sector_addr = sector_addr.saturating_add(SECTOR_SIZE);
        }
        Ok(())
    }

    fn device_erase(&mut self, addr: u32, len: u32) -> Result<(), StorageError> {
        if self.device.is_xip() {
            let _guard = SchedulerGuard::acquire(self.scheduler.clone());
            self.device.erase(addr, len)
        } else {
            self.device.erase(addr, len)
        }
    }

    /// CRC32 of `size` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the first device read error.
    pub fn calc_crc(&mut self, offset: u32, size: u32) -> Result<u32, StorageError> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; self.read_segment];
        let mut addr = offset;
        let mut remaining = size as usize;
        while remaining > 0 {
            let len = remaining.min(buf.len());
            let chunk = buf.get_mut(..len).unwrap_or_default();
            self.read(addr, chunk)?;
            let start = Instant::now();
            hasher.update(chunk);
            self.stats.crc = self.stats.crc.saturating_add(start.elapsed());
            addr = addr.wrapping_add(len as u32);
            remaining = remaining.saturating_sub(len);
        }
        Ok(hasher.finalize())
    }

    /// SHA-256 of `size` bytes at `offset`, with the image magic substituted
    /// into the first four bytes.
    ///
    /// A staged image keeps its magic erased until commit, so the hash is
    /// taken over the bytes it will have once committed.
    ///
    /// # Errors
    ///
    /// Returns the first device read error.
    pub fn image_hash(&mut self, offset: u32, size: u32) -> Result<[u8; DIGEST_LEN], StorageError> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.read_segment];
        let mut addr = offset;
        let mut remaining = size as usize;
        let mut first = true;
        while remaining > 0 {
            let len = remaining.min(buf.len());
            let chunk = buf.get_mut(..len).unwrap_or_default();
            self.read(addr, chunk)?;
            if first {
                substitute_magic(chunk);
                first = false;
            }
            let start = Instant::now();
            hasher.update(&*chunk);
            self.stats.hash = self.stats.hash.saturating_add(start.elapsed());
            addr = addr.wrapping_add(len as u32);
            remaining = remaining.saturating_sub(len);
        }
        Ok(hasher.finalize().into())
    }

    /// Verify the RSA signature stored at `sig_offset` over the image hash of
    /// `[offset, offset + size)`.
    ///
    /// Returns `Ok(false)` when the signature does not verify.
    ///
    /// # Errors
    ///
    /// Returns a device read error.
    pub fn check_image_signature(
        &mut self,
        key: &ImageVerifyingKey,
        offset: u32,
        size: u32,
        sig_offset: u32,
        sig_len: usize,
    ) -> Result<bool, StorageError> {
        let digest = self.image_hash(offset, size)?;
        let mut signature = vec![0u8; sig_len];
        self.read(sig_offset, &mut signature)?;
        Ok(key.verify_digest(&digest, &signature).is_ok())
    }

    /// Head of the image staged at `offset`, read with the magic substituted.
    ///
    /// # Errors
    ///
    /// Returns a device read error or a head validation error.
    pub fn staged_header(&mut self, offset: u32) -> Result<ImageHeader, OtaError> {
        let mut head = vec![0u8; HEAD_SIZE];
        self.read(offset, &mut head)?;
        substitute_magic(&mut head);
        Ok(ImageHeader::parse(&head)?)
    }

    /// Check the image staged at `offset`: head CRC, then payload CRC.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::HeaderChecksum`] or [`ImageError::DataChecksum`]
    /// on mismatch, or a device read error.
    pub fn check_image(&mut self, offset: u32) -> Result<(), OtaError> {
        let header = self.staged_header(offset)?;
        let start = offset.saturating_add(u32::from(header.data_offset));
        let len = header.data_size.saturating_sub(u32::from(header.data_offset));
        let actual = self.calc_crc(start, len)?;
        if actual != header.data_checksum {
            return Err(ImageError::DataChecksum {
                expected: header.data_checksum,
                actual,
            }
            .into());
        }
        debug!(offset, size = header.data_size, "staged image crc pass");
        Ok(())
    }
}

/// Replace the leading bytes of `chunk` with the image magic unless it is
/// already present.
pub(crate) fn substitute_magic(chunk: &mut [u8]) {
    if let Some(head) = chunk.get_mut(..IMAGE_MAGIC_BYTES.len())
        && head != IMAGE_MAGIC_BYTES
    {
        head.copy_from_slice(&IMAGE_MAGIC_BYTES);
    }
}
