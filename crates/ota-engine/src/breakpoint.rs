//! Breakpoint journal
//!
//! One fixed-size record, persisted under [`BREAKPOINT_KEY`] in non-volatile
//! configuration storage, describes how far an upgrade got:
//!
//! - the global [`BreakpointState`]
//! - a [`FileState`] for up to eight file ids
//! - the file currently being written and the offset below which its
//!   destination holds valid data
//!
//! The store is assumed to replace a key atomically; a torn or foreign record
//! fails its CRC and is treated as absent.

use ota_errors::{ImageError, JournalError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::BackendType;
use crate::image::header::FILE_NAME_LEN;
use crate::manifest::ManifestFile;
use crate::partition::PartitionType;
use crate::wire::{ByteReader, ByteWriter, crc32};

/// Store key of the record.
pub const BREAKPOINT_KEY: &str = "OTA_BP";

/// Record magic ("OTBP" little-endian).
pub const BREAKPOINT_MAGIC: u32 = 0x5042_544F;

/// Record layout version.
pub const BREAKPOINT_LAYOUT_VERSION: u16 = 1;

/// Encoded record size.
pub const BREAKPOINT_RECORD_SIZE: usize = 80;

/// Number of file-state slots.
pub const FILE_SLOTS: usize = 8;

/// Non-volatile key/value store holding the record.
pub trait NvStore: Send {
    /// Value stored under `key`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Store`] if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JournalError>;

    /// Atomically replace the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Store`] if the store cannot be written.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalError>;
}

impl<S: NvStore + ?Sized> NvStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, JournalError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalError> {
        (**self).set(key, value)
    }
}

/// Global upgrade state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointState {
    /// Nothing known about the destination
    #[default]
    Unknown,
    /// Destination erased and ready
    Clean,
    /// Staging an image into the temp partition
    WritingImg,
    /// Staging failed or the image was refused
    WritingImgFail,
    /// Writing files into their partitions
    UpgradeWriting,
    /// Writing files failed
    UpgradingFail,
    /// Staged image committed, waiting for the secondary stage
    UpgradePending,
    /// All files written and verified
    UpgradeDone,
    /// Another updater claimed a partition
    UpgradeWritingOther,
}

impl BreakpointState {
    /// Code stored in the record.
    pub fn code(self) -> u8 {
        match self {
            BreakpointState::Unknown => 0,
            BreakpointState::Clean => 1,
            BreakpointState::WritingImg => 2,
            BreakpointState::WritingImgFail => 3,
            BreakpointState::UpgradeWriting => 4,
            BreakpointState::UpgradingFail => 5,
            BreakpointState::UpgradePending => 6,
            BreakpointState::UpgradeDone => 7,
            BreakpointState::UpgradeWritingOther => 8,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => BreakpointState::Clean,
            2 => BreakpointState::WritingImg,
            3 => BreakpointState::WritingImgFail,
            4 => BreakpointState::UpgradeWriting,
            5 => BreakpointState::UpgradingFail,
            6 => BreakpointState::UpgradePending,
            7 => BreakpointState::UpgradeDone,
            8 => BreakpointState::UpgradeWritingOther,
            _ => BreakpointState::Unknown,
        }
    }

    /// An installed or installing upgrade owns the inactive bank.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            BreakpointState::UpgradePending
                | BreakpointState::UpgradeWriting
                | BreakpointState::UpgradeDone
        )
    }

    /// Like [`is_in_progress`](Self::is_in_progress), also counting staging.
    pub fn is_running(self) -> bool {
        self.is_in_progress() || self == BreakpointState::WritingImg
    }

    /// A previous attempt left data that later attempts may resume.
    pub fn is_writing(self) -> bool {
        matches!(
            self,
            BreakpointState::UpgradeWriting
                | BreakpointState::WritingImg
                | BreakpointState::UpgradeWritingOther
        )
    }
}

impl std::fmt::Display for BreakpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BreakpointState::Unknown => "unknown",
            BreakpointState::Clean => "clean",
            BreakpointState::WritingImg => "writing_img",
            BreakpointState::WritingImgFail => "writing_img_fail",
            BreakpointState::UpgradeWriting => "upgrade_writing",
            BreakpointState::UpgradingFail => "upgrading_fail",
            BreakpointState::UpgradePending => "upgrade_pending",
            BreakpointState::UpgradeDone => "upgrade_done",
            BreakpointState::UpgradeWritingOther => "upgrade_writing_other",
        };
        f.write_str(name)
    }
}

/// Per-file state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Destination must be erased before use
    #[default]
    Unknown,
    /// Destination erased
    Clean,
    /// Write about to start at the journaled offset
    WriteStart,
    /// Written up to the journaled offset, rest not erased
    Writing,
    /// Patch output in progress; cannot be resumed
    WritingDirty,
    /// Written up to the journaled offset, rest erased
    WritingClean,
    /// Every byte written
    WriteDone,
    /// Written and verified
    VerifyPass,
    /// Write failed
    WriteFail,
    /// Verification failed
    VerifyFail,
    /// Claimed by another updater
    OtherWriting,
}

impl FileState {
    /// Code stored in the record.
    pub fn code(self) -> u8 {
        match self {
            FileState::Unknown => 0,
            FileState::Clean => 1,
            FileState::WriteStart => 2,
            FileState::Writing => 3,
            FileState::WritingDirty => 4,
            FileState::WritingClean => 5,
            FileState::WriteDone => 6,
            FileState::VerifyPass => 7,
            FileState::WriteFail => 8,
            FileState::VerifyFail => 9,
            FileState::OtherWriting => 10,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FileState::Clean,
            2 => FileState::WriteStart,
            3 => FileState::Writing,
            4 => FileState::WritingDirty,
            5 => FileState::WritingClean,
            6 => FileState::WriteDone,
            7 => FileState::VerifyPass,
            8 => FileState::WriteFail,
            9 => FileState::VerifyFail,
            10 => FileState::OtherWriting,
            _ => FileState::Unknown,
        }
    }

    /// Every byte of the file is on flash.
    pub fn is_done(self) -> bool {
        matches!(self, FileState::WriteDone | FileState::VerifyPass)
    }

    /// The file is partly written.
    pub fn is_partial(self) -> bool {
        matches!(
            self,
            FileState::WriteStart
                | FileState::Writing
                | FileState::WritingDirty
                | FileState::WritingClean
        )
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileState::Unknown => "unknown",
            FileState::Clean => "clean",
            FileState::WriteStart => "write_start",
            FileState::Writing => "writing",
            FileState::WritingDirty => "writing_dirty",
            FileState::WritingClean => "writing_clean",
            FileState::WriteDone => "write_done",
            FileState::VerifyPass => "verify_pass",
            FileState::WriteFail => "write_fail",
            FileState::VerifyFail => "verify_fail",
            FileState::OtherWriting => "other_writing",
        };
        f.write_str(name)
    }
}

/// One file-state slot; file id 0 marks a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileSlot {
    /// File id
    pub file_id: u8,
    /// State
    pub state: FileState,
}

/// The file described by the journal cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrentFile {
    /// Directory name
    pub name: String,
    /// File id
    pub file_id: u8,
    /// Content type
    pub file_type: PartitionType,
    /// Destination flash address
    pub offset: u32,
    /// File size
    pub size: u32,
    /// Expected CRC32
    pub checksum: u32,
}

impl From<&ManifestFile> for CurrentFile {
    fn from(file: &ManifestFile) -> Self {
        Self {
            name: file.name.clone(),
            file_id: file.file_id,
            file_type: file.file_type,
            offset: file.offset,
            size: file.size,
            checksum: file.checksum,
        }
    }
}

/// Decoded journal record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    /// Save sequence number
    pub bp_id: u32,
    /// Version code the device ran when the record was created
    pub old_version: u32,
    /// Version code of the image being installed
    pub new_version: u32,
    /// Payload checksum of the image being installed
    pub data_checksum: u32,
    /// Bank being written
    pub mirror_id: u8,
    /// Global state
    pub state: BreakpointState,
    /// Transport of the image being installed
    pub backend_type: BackendType,
    /// File-state map
    pub file_states: [FileSlot; FILE_SLOTS],
    /// File being written
    pub cur_file: CurrentFile,
    /// Offset into `cur_file` below which flash holds valid data
    pub cur_file_write_offset: u32,
}

impl Breakpoint {
    /// Fresh record for a device running `old_version` that writes bank `mirror_id`.
    pub fn with_defaults(old_version: u32, mirror_id: u8) -> Self {
        Self {
            old_version,
            mirror_id,
            ..Self::default()
        }
    }

    /// Decode and validate a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidLength`] or [`JournalError::Corrupt`]
    /// for a record of the wrong size, magic, layout or CRC.
    pub fn decode(buf: &[u8]) -> Result<Self, JournalError> {
        if buf.len() != BREAKPOINT_RECORD_SIZE {
            return Err(JournalError::InvalidLength {
                expected: BREAKPOINT_RECORD_SIZE,
                actual: buf.len(),
            });
        }
        let crc_at = BREAKPOINT_RECORD_SIZE.saturating_sub(4);
        let (body, tail) = buf.split_at(crc_at);
        let stored = u32::from_le_bytes(
            tail.try_into()
                .map_err(|_| JournalError::Corrupt("short crc field".into()))?,
        );
        let actual = crc32(body);
        if stored != actual {
            return Err(JournalError::Corrupt(format!(
                "crc {stored:#010x} != {actual:#010x}"
            )));
        }
        let mut header = ByteReader::new(body);
        let magic = header.u32().map_err(|e| JournalError::Corrupt(e.to_string()))?;
        if magic != BREAKPOINT_MAGIC {
            return Err(JournalError::Corrupt(format!("magic {magic:#010x}")));
        }
        let layout = header.u16().map_err(|e| JournalError::Corrupt(e.to_string()))?;
        if layout != BREAKPOINT_LAYOUT_VERSION {
            return Err(JournalError::Corrupt(format!("layout version {layout}")));
        }
        decode_body(body).map_err(|e| JournalError::Corrupt(e.to_string()))
    }

    /// Encode to the fixed record layout, CRC included.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(BREAKPOINT_RECORD_SIZE);
        w.u32(BREAKPOINT_MAGIC)
            .u16(BREAKPOINT_LAYOUT_VERSION)
            .u16(0)
            .u32(self.bp_id)
            .u32(self.old_version)
            .u32(self.new_version)
            .u32(self.data_checksum)
            .u8(self.mirror_id)
            .u8(self.state.code())
            .u8(self.backend_type.code())
            .u8(0);
        for slot in &self.file_states {
            w.u8(slot.file_id).u8(slot.state.code());
        }
        w.fixed_str(&self.cur_file.name, FILE_NAME_LEN)
            .u8(self.cur_file.file_id)
            .u8(self.cur_file.file_type.code())
            .u16(0)
            .u32(self.cur_file.offset)
            .u32(self.cur_file.size)
            .u32(self.cur_file.checksum)
            .u32(self.cur_file_write_offset);
        let mut record = w.into_inner();
        let crc = crc32(&record);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// State recorded for `file_id`; `Unknown` when it has no slot.
    pub fn file_state(&self, file_id: u8) -> FileState {
        self.file_states
            .iter()
            .find(|s| s.file_id == file_id && file_id != 0)
            .map_or(FileState::Unknown, |s| s.state)
    }

    /// Record `state` for `file_id`, taking the first free slot if needed.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotsFull`] when all eight slots hold other ids.
    pub fn set_file_state(&mut self, file_id: u8, state: FileState) -> Result<(), JournalError> {
        if let Some(slot) = self
            .file_states
            .iter_mut()
            .find(|s| s.file_id == file_id && file_id != 0)
        {
            slot.state = state;
            return Ok(());
        }
        let slot = self
            .file_states
            .iter_mut()
            .find(|s| s.file_id == 0)
            .ok_or(JournalError::SlotsFull { file_id })?;
        *slot = FileSlot { file_id, state };
        Ok(())
    }

    /// Forget every file state and the cursor.
    pub fn clear_file_states(&mut self) {
        self.file_states = [FileSlot::default(); FILE_SLOTS];
        self.cur_file = CurrentFile::default();
        self.cur_file_write_offset = 0;
        self.data_checksum = 0;
    }

    /// File ids currently in a partial state.
    pub fn partial_files(&self) -> impl Iterator<Item = u8> + '_ {
        self.file_states
            .iter()
            .filter(|s| s.file_id != 0 && s.state.is_partial())
            .map(|s| s.file_id)
    }
}

/// Fields after magic and layout version.
fn decode_body(body: &[u8]) -> Result<Breakpoint, ImageError> {
    let mut r = ByteReader::new(body);
    r.skip(8)?;
    let bp_id = r.u32()?;
    let old_version = r.u32()?;
    let new_version = r.u32()?;
    let data_checksum = r.u32()?;
    let mirror_id = r.u8()?;
    let state = BreakpointState::from_code(r.u8()?);
    let backend_type = BackendType::from_code(r.u8()?);
    r.skip(1)?;
    let mut file_states = [FileSlot::default(); FILE_SLOTS];
    for slot in &mut file_states {
        slot.file_id = r.u8()?;
        slot.state = FileState::from_code(r.u8()?);
    }
    let name = r.fixed_str(FILE_NAME_LEN)?;
    let file_id = r.u8()?;
    let file_type = PartitionType::from_code(r.u8()?);
    r.skip(2)?;
    let cur_file = CurrentFile {
        name,
        file_id,
        file_type,
        offset: r.u32()?,
        size: r.u32()?,
        checksum: r.u32()?,
    };
    let cur_file_write_offset = r.u32()?;
    Ok(Breakpoint {
        bp_id,
        old_version,
        new_version,
        data_checksum,
        mirror_id,
        state,
        backend_type,
        file_states,
        cur_file,
        cur_file_write_offset,
    })
}

/// Read the stored record, `None` if absent or invalid.
///
/// # Errors
///
/// Returns [`JournalError::Store`] only if the store itself fails.
pub fn read_breakpoint(store: &dyn NvStore) -> Result<Option<Breakpoint>, JournalError> {
    let Some(raw) = store.get(BREAKPOINT_KEY)? else {
        return Ok(None);
    };
    match Breakpoint::decode(&raw) {
        Ok(bp) => Ok(Some(bp)),
        Err(e) => {
            warn!(error = %e, "stored breakpoint ignored");
            Ok(None)
        }
    }
}

/// Whether the stored journal shows an upgrade in progress, including staging.
///
/// Usable before any image is opened.
///
/// # Errors
///
/// Returns [`JournalError::Store`] if the store cannot be read.
pub fn is_ota_running(store: &dyn NvStore) -> Result<bool, JournalError> {
    Ok(read_breakpoint(store)?.is_some_and(|bp| bp.state.is_running()))
}

/// Single-owner handle over the persisted record.
///
/// All mutation goes through this type; every persisted change bumps
/// [`Breakpoint::bp_id`].
pub struct BreakpointJournal {
    store: Box<dyn NvStore>,
    bp: Breakpoint,
    save_granule: u32,
}

impl std::fmt::Debug for BreakpointJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointJournal")
            .field("bp", &self.bp)
            .field("save_granule", &self.save_granule)
            .finish_non_exhaustive()
    }
}

impl BreakpointJournal {
    /// Journal over `store`, saving a writing file at least every
    /// `save_granule` bytes of progress.
    pub fn new(store: Box<dyn NvStore>, save_granule: u32) -> Self {
        Self {
            store,
            bp: Breakpoint::default(),
            save_granule,
        }
    }

    /// Load the stored record, or install and save `defaults` when there is
    /// no valid one. Returns whether a record was loaded.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Store`] if the store fails.
    pub fn load_or_init(&mut self, defaults: Breakpoint) -> Result<bool, JournalError> {
        match read_breakpoint(self.store.as_ref())? {
            Some(bp) => {
                info!(state = %bp.state, bp_id = bp.bp_id, "breakpoint loaded");
                self.bp = bp;
                Ok(true)
            }
            None => {
                info!("no breakpoint stored, using defaults");
                self.bp = defaults;
                self.save()?;
                Ok(false)
            }
        }
    }

    /// Current record.
    pub fn breakpoint(&self) -> &Breakpoint {
        &self.bp
    }

    /// Mutable access for fields outside the state primitives.
    pub(crate) fn breakpoint_mut(&mut self) -> &mut Breakpoint {
        &mut self.bp
    }

    /// Replace the in-memory record without saving.
    pub(crate) fn reset(&mut self, bp: Breakpoint) {
        self.bp = bp;
    }

    /// Global state.
    pub fn state(&self) -> BreakpointState {
        self.bp.state
    }

    /// Forward progress between saves of a writing file.
    pub fn save_granule(&self) -> u32 {
        self.save_granule
    }

    /// Persist the record.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Store`] if the store fails.
    pub fn save(&mut self) -> Result<(), JournalError> {
        self.bp.bp_id = self.bp.bp_id.wrapping_add(1);
        debug!(
            bp_id = self.bp.bp_id,
            state = %self.bp.state,
            file = %self.bp.cur_file.name,
            write_offset = self.bp.cur_file_write_offset,
            "breakpoint save"
        );
        self.store.set(BREAKPOINT_KEY, &self.bp.encode())
    }

    /// Set and persist the global state. Entering `UpgradeDone` or
    /// `UpgradePending` clears every file state.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Store`] if the store fails.
    pub fn update_state(&mut self, state: BreakpointState) -> Result<(), JournalError> {
        info!(from = %self.bp.state, to = %state, "breakpoint state");
        self.bp.state = state;
        if matches!(
            state,
            BreakpointState::UpgradeDone | BreakpointState::UpgradePending
        ) {
            self.bp.clear_file_states();
        }
        self.save()
    }

    /// State recorded for `file_id`.
    pub fn file_state(&self, file_id: u8) -> FileState {
        self.bp.file_state(file_id)
    }

    /// Record a file state without saving.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotsFull`].
    pub fn set_file_state(&mut self, file_id: u8, state: FileState) -> Result<(), JournalError> {
        self.bp.set_file_state(file_id, state)
    }

    /// Forget every file state and the cursor, without saving.
    pub fn clear_all_file_states(&mut self) {
        self.bp.clear_file_states();
    }

    /// Record progress of `file`.
    ///
    /// - `WriteStart` moves the cursor to `file` at `offset` without saving.
    /// - `Writing` saves only when forced, when `offset` equals the saved
    ///   offset, or when it advanced by at least the save granule.
    /// - Any other state saves immediately.
    ///
    /// Entering `Writing` or `WritingDirty` demotes every other partial file
    /// to `WriteFail`; the cursor can describe only one file.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::SlotsFull`] or a store error.
    pub fn update_file_state(
        &mut self,
        file: &CurrentFile,
        state: FileState,
        offset: u32,
        force: bool,
    ) -> Result<(), JournalError> {
        debug!(file_id = file.file_id, %state, offset, "file state");
        let need_save = match state {
            FileState::WriteStart => {
                self.bp.cur_file = file.clone();
                self.bp.cur_file_write_offset = offset;
                false
            }
            FileState::Writing => {
                let advanced = offset.checked_sub(self.bp.cur_file_write_offset);
                let save = force
                    || advanced.is_some_and(|d| d == 0 || d >= self.save_granule);
                if save {
                    self.bp.cur_file_write_offset = offset;
                }
                save
            }
            _ => true,
        };

        if matches!(state, FileState::Writing | FileState::WritingDirty) {
            let others: Vec<u8> = self
                .bp
                .partial_files()
                .filter(|&id| id != file.file_id)
                .collect();
            for id in others {
                warn!(file_id = id, "partial file demoted");
                self.bp.set_file_state(id, FileState::WriteFail)?;
            }
        }

        self.bp.set_file_state(file.file_id, state)?;
        if need_save {
            self.save()?;
        }
        Ok(())
    }
}
