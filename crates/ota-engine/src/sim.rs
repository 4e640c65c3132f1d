//! In-memory board for tests, benches and the command line tool
//!
//! - [`SimFlash`]: NOR flash with program-only-clears-bits semantics
//! - [`MemoryNvStore`] / [`FileNvStore`]: key-value stores for the journal
//! - [`SimPlatform`]: version and flash mapping over a [`SimFlash`]
//!
//! Clones of a [`SimFlash`] or [`MemoryNvStore`] share the same state, so a
//! test can keep a handle while the engine owns another.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ota_errors::{JournalError, StorageError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::breakpoint::NvStore;
use crate::flash::{ENCRYPT_ADDR_FLAG, ERASED_BYTE, FlashDevice, SECTOR_SIZE};
use crate::platform::{MappedRegion, Platform, deframe, framed_len};
use crate::version::FirmwareVersion;

/// Chip id the simulated device reports.
pub const SIM_CHIP_ID: u32 = 0x00EF_4018;

#[derive(Debug)]
struct SimFlashState {
    cells: Vec<u8>,
    write_protected: bool,
    program_count: usize,
    erase_log: Vec<(u32, u32)>,
}

/// Simulated NOR flash.
#[derive(Debug, Clone)]
pub struct SimFlash {
    name: String,
    xip: bool,
    state: Arc<Mutex<SimFlashState>>,
}

impl SimFlash {
    /// Fully erased device of `capacity` bytes.
    pub fn new(capacity: u32) -> Self {
        Self::from_bytes(vec![ERASED_BYTE; capacity as usize])
    }

    /// Device holding a copy of `cells`.
    pub fn from_bytes(cells: Vec<u8>) -> Self {
        Self {
            name: "simflash".into(),
            xip: true,
            state: Arc::new(Mutex::new(SimFlashState {
                cells,
                write_protected: false,
                program_count: 0,
                erase_log: Vec::new(),
            })),
        }
    }

    /// Rename the device.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Report the device as execute-in-place or not.
    pub fn with_xip(mut self, xip: bool) -> Self {
        self.xip = xip;
        self
    }

    /// Copy of the whole device.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().cells.clone()
    }

    /// Copy of `len` bytes at `offset`, clipped to the device.
    pub fn slice(&self, offset: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let start = (offset as usize).min(state.cells.len());
        let end = start.saturating_add(len).min(state.cells.len());
        state.cells.get(start..end).unwrap_or_default().to_vec()
    }

    /// Overwrite bytes directly, bypassing NOR semantics.
    pub fn poke(&self, offset: u32, data: &[u8]) {
        let mut state = self.state.lock();
        let start = offset as usize;
        if let Some(dst) = state.cells.get_mut(start..start.saturating_add(data.len())) {
            dst.copy_from_slice(data);
        }
    }

    /// Number of program operations so far.
    pub fn program_count(&self) -> usize {
        self.state.lock().program_count
    }

    /// Every erase issued, as `(offset, len)`.
    pub fn erase_log(&self) -> Vec<(u32, u32)> {
        self.state.lock().erase_log.clone()
    }

    /// Forget recorded erases and programs.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.erase_log.clear();
        state.program_count = 0;
    }

    fn check_range(cells: &[u8], offset: u32, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = offset as usize;
        start
            .checked_add(len)
            .filter(|&end| end <= cells.len())
            .map(|end| start..end)
            .ok_or(StorageError::OutOfRange {
                offset,
                len: len as u64,
                capacity: u32::try_from(cells.len()).unwrap_or(u32::MAX),
            })
    }
}

impl FlashDevice for SimFlash {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u32 {
        u32::try_from(self.state.lock().cells.len()).unwrap_or(u32::MAX)
    }

    fn is_xip(&self) -> bool {
        self.xip
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let state = self.state.lock();
        let range = Self::check_range(&state.cells, offset & !ENCRYPT_ADDR_FLAG, buf.len())?;
        buf.copy_from_slice(state.cells.get(range).unwrap_or_default());
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.write_protected {
            return Err(StorageError::WriteProtected);
        }
        let range = Self::check_range(&state.cells, offset & !ENCRYPT_ADDR_FLAG, data.len())?;
        if let Some(cells) = state.cells.get_mut(range) {
            for (cell, &b) in cells.iter_mut().zip(data) {
                *cell &= b;
            }
        }
        state.program_count = state.program_count.saturating_add(1);
        trace!(offset, len = data.len(), "sim program");
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), StorageError> {
        if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            return Err(StorageError::Misaligned {
                offset,
                len,
                align: SECTOR_SIZE,
            });
        }
        let mut state = self.state.lock();
        if state.write_protected {
            return Err(StorageError::WriteProtected);
        }
        let range = Self::check_range(&state.cells, offset, len as usize)?;
        if let Some(cells) = state.cells.get_mut(range) {
            cells.fill(ERASED_BYTE);
        }
        state.erase_log.push((offset, len));
        trace!(offset, len, "sim erase");
        Ok(())
    }

    fn read_chip_id(&mut self) -> Result<u32, StorageError> {
        Ok(SIM_CHIP_ID)
    }

    fn set_write_protect(&mut self, enabled: bool) -> Result<(), StorageError> {
        self.state.lock().write_protected = enabled;
        Ok(())
    }
}

/// Key-value store held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryNvStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryNvStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value under `key`.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    /// Replace the raw value under `key`.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.values.lock().insert(key.to_string(), value);
    }

    /// Drop `key`.
    pub fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl NvStore for MemoryNvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JournalError> {
        Ok(self.raw(key))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalError> {
        self.insert_raw(key, value.to_vec());
        let mut writes = self.writes.lock();
        *writes = writes.saturating_add(1);
        Ok(())
    }
}

/// Key-value store persisted as a JSON map of hex strings.
#[derive(Debug, Clone)]
pub struct FileNvStore {
    path: PathBuf,
}

impl FileNvStore {
    /// Store backed by `path`; the file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, JournalError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| JournalError::store(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(JournalError::store(format!("{}: {e}", self.path.display()))),
        }
    }
}

impl NvStore for FileNvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JournalError> {
        let map = self.load()?;
        map.get(key)
            .map(|v| hex::decode(v).map_err(|e| JournalError::Corrupt(format!("{key}: {e}"))))
            .transpose()
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalError> {
        let mut map = self.load()?;
        map.insert(key.to_string(), hex::encode(value));
        let text = serde_json::to_string_pretty(&map).map_err(|e| JournalError::store(e.to_string()))?;
        std::fs::write(&self.path, text)
            .map_err(|e| JournalError::store(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), key, "nv store written");
        Ok(())
    }
}

/// Board services over a [`SimFlash`].
#[derive(Debug, Clone)]
pub struct SimPlatform {
    version: Arc<Mutex<FirmwareVersion>>,
    flash: SimFlash,
}

impl SimPlatform {
    /// Platform running `version` with `flash` as its boot device.
    pub fn new(version: FirmwareVersion, flash: SimFlash) -> Self {
        Self {
            version: Arc::new(Mutex::new(version)),
            flash,
        }
    }

    /// Flash this platform maps.
    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }
}

impl Platform for SimPlatform {
    fn current_version(&self) -> FirmwareVersion {
        self.version.lock().clone()
    }

    fn map(&self, offset: u32, len: usize, crc_framed: bool) -> Result<MappedRegion<'_>, StorageError> {
        let physical = if crc_framed { framed_len(len) } else { len };
        let capacity = self.flash.capacity();
        let end = (offset as usize).checked_add(physical);
        if end.is_none_or(|end| end > capacity as usize) {
            return Err(StorageError::OutOfRange {
                offset,
                len: physical as u64,
                capacity,
            });
        }
        let bytes = self.flash.slice(offset, physical);
        let bytes = if crc_framed { deframe(&bytes, len) } else { bytes };
        Ok(MappedRegion::owned(offset, bytes))
    }
}
