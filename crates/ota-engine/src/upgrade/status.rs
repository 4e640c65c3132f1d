//! Journal queries and the other-writer claim, usable without an engine.

use ota_errors::{JournalError, OtaError};
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::BackendType;
use crate::breakpoint::{Breakpoint, BreakpointState, FileSlot, FileState, NvStore, read_breakpoint};
use crate::partition::{PartitionEntry, PartitionTable, file_id};

/// Snapshot of the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeStatus {
    /// Global state
    pub state: BreakpointState,
    /// An installed or installing upgrade owns the inactive bank
    pub in_progress: bool,
    /// Like `in_progress`, also counting staging
    pub running: bool,
    /// Transport of the journaled attempt
    pub backend: BackendType,
    /// Version code being installed
    pub new_version: u32,
    /// File under the cursor, if any
    pub current_file: Option<String>,
    /// Bytes of the cursor file known to be on flash
    pub write_offset: u32,
    /// Occupied file-state slots
    pub files: Vec<FileSlot>,
}

impl UpgradeStatus {
    /// Summarize `bp`.
    pub fn from_breakpoint(bp: &Breakpoint) -> Self {
        Self {
            state: bp.state,
            in_progress: bp.state.is_in_progress(),
            running: bp.state.is_running(),
            backend: bp.backend_type,
            new_version: bp.new_version,
            current_file: (bp.cur_file.file_id != 0).then(|| bp.cur_file.name.clone()),
            write_offset: bp.cur_file_write_offset,
            files: bp.file_states.iter().filter(|s| s.file_id != 0).copied().collect(),
        }
    }
}

/// Status of the stored journal, `None` when there is no valid record.
///
/// # Errors
///
/// Returns [`JournalError::Store`] if the store cannot be read.
pub fn read_status(store: &dyn NvStore) -> Result<Option<UpgradeStatus>, JournalError> {
    Ok(read_breakpoint(store)?.map(|bp| UpgradeStatus::from_breakpoint(&bp)))
}

/// Partitions another updater may claim: the inactive bank, or any
/// partition when the device installs through recovery.
fn claimable<'a>(
    table: &'a dyn PartitionTable,
    recovery: bool,
    wanted: u8,
) -> Option<&'a PartitionEntry> {
    table
        .entries()
        .iter()
        .filter(|p| p.file_id != 0)
        .filter(|p| recovery || table.is_mirror_part(p))
        .find(|p| p.file_id == wanted)
}

fn claim(bp: &mut Breakpoint, part: &PartitionEntry, recovery: bool) -> Result<(), JournalError> {
    bp.state = BreakpointState::UpgradeWritingOther;
    bp.cur_file.offset = part.offset;
    bp.cur_file_write_offset = 0;
    bp.set_file_state(part.file_id, FileState::OtherWriting)?;
    if recovery {
        bp.set_file_state(file_id::OTA_TEMP, FileState::OtherWriting)?;
    } else {
        bp.set_file_state(file_id::SYSTEM, FileState::OtherWriting)?;
        bp.set_file_state(file_id::SDFS, FileState::OtherWriting)?;
    }
    Ok(())
}

fn save(store: &mut dyn NvStore, bp: &mut Breakpoint) -> Result<(), JournalError> {
    bp.bp_id = bp.bp_id.wrapping_add(1);
    store.set(crate::breakpoint::BREAKPOINT_KEY, &bp.encode())
}

/// Mark partition `wanted` as owned by another updater, so the next upgrade
/// attempt erases it. Already-claimed journals are left alone.
///
/// # Errors
///
/// Returns [`OtaError::UnknownPartition`] when no claimable partition holds
/// `wanted`, or a journal error.
pub fn set_other_writing(
    store: &mut dyn NvStore,
    table: &dyn PartitionTable,
    recovery: bool,
    wanted: u8,
) -> Result<(), OtaError> {
    let part = claimable(table, recovery, wanted).ok_or(OtaError::UnknownPartition { file_id: wanted })?;
    let mut bp = read_breakpoint(store)?.unwrap_or_default();
    if bp.state != BreakpointState::UpgradeWritingOther {
        claim(&mut bp, part, recovery)?;
        save(store, &mut bp)?;
        info!(file_id = wanted, part = %part.name, "partition claimed by other writer");
    }
    Ok(())
}

/// Partition `wanted` if another updater may write it now.
///
/// An idle journal (`Clean`) is claimed on the spot; a journal already
/// claimed for `wanted` returns the same partition. Anything else means an
/// OTA owns the bank and yields `None`.
///
/// # Errors
///
/// Returns a journal error if the store fails.
pub fn other_writing_partition(
    store: &mut dyn NvStore,
    table: &dyn PartitionTable,
    recovery: bool,
    wanted: u8,
) -> Result<Option<PartitionEntry>, OtaError> {
    let Some(part) = claimable(table, recovery, wanted) else {
        return Ok(None);
    };
    let mut bp = read_breakpoint(store)?.unwrap_or_default();
    match bp.state {
        BreakpointState::Clean => {
            claim(&mut bp, part, recovery)?;
            save(store, &mut bp)?;
            info!(file_id = wanted, part = %part.name, "partition claimed by other writer");
            Ok(Some(part.clone()))
        }
        BreakpointState::UpgradeWritingOther if bp.file_state(wanted) == FileState::OtherWriting => {
            Ok(Some(part.clone()))
        }
        state => {
            warn!(%state, file_id = wanted, "partition owned by ota");
            Ok(None)
        }
    }
}
