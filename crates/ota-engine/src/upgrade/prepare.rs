//! Erase passes run before any file is written.

use std::sync::Arc;

use ota_errors::OtaError;
use tracing::{debug, info};

use super::OtaUpgrade;
use crate::breakpoint::{Breakpoint, BreakpointState, FileState};
use crate::config::InstallMode;
use crate::event::OtaState;
use crate::flash::{BLOCK_SIZE, SECTOR_SIZE, align_down, align_up};
use crate::partition::{PartitionEntry, PartitionType, file_id};

/// Blocks sampled by the cleanliness probe.
const CLEAN_PROBE_BLOCKS: u32 = 4;

impl OtaUpgrade {
    /// Whether an attempt in the configured mode may write `part`.
    pub(super) fn is_prepare_target(&self, part: &PartitionEntry) -> bool {
        if part.file_id == 0 {
            return false;
        }
        let local = part.storage_id == self.storage.storage_id();
        match self.config.install_mode {
            InstallMode::Mirror => self.table.is_mirror_part(part) && !part.is_preserved(),
            InstallMode::RecoveryApp => {
                local && matches!(part.file_id, file_id::SYSTEM | file_id::SDFS)
            }
            InstallMode::Recovery => {
                local && (part.part_type == PartitionType::Temp || part.file_id == file_id::OTA_TEMP)
            }
        }
    }

    fn prepare_targets(&self) -> Vec<PartitionEntry> {
        let table = Arc::clone(&self.table);
        table
            .entries()
            .iter()
            .filter(|p| self.is_prepare_target(p))
            .cloned()
            .collect()
    }

    /// Erase every target partition that is not already clean and mark the
    /// journal `Clean`. Runs at engine construction.
    pub(super) fn prepare_init(&mut self) -> Result<(), OtaError> {
        for part in self.prepare_targets() {
            if !self.part_is_clean(&part)? {
                info!(part = %part.name, "partition dirty, erasing");
                self.erase_part(&part, 0, true)?;
            }
            self.journal.set_file_state(part.file_id, FileState::Clean)?;
        }
        self.journal.update_state(BreakpointState::Clean)?;
        Ok(())
    }

    /// Sample the first sector of up to four 64 KiB blocks.
    fn part_is_clean(&mut self, part: &PartitionEntry) -> Result<bool, OtaError> {
        if self.config.install_mode == InstallMode::RecoveryApp {
            return Ok(false);
        }
        for block in 0..CLEAN_PROBE_BLOCKS {
            let stride = block.saturating_mul(BLOCK_SIZE);
            if part.size < stride {
                break;
            }
            if !self.storage.is_clean(part.offset.saturating_add(stride), SECTOR_SIZE)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Erase `part` from `start` (relative to the partition) to its end.
    ///
    /// An initial erase skips the read-back and clears the first sector last,
    /// so an interrupted erase still leaves the partition head dirty.
    pub(super) fn erase_part(&mut self, part: &PartitionEntry, start: u32, initial: bool) -> Result<(), OtaError> {
        let addr = align_down(part.offset.saturating_add(start), SECTOR_SIZE);
        let size = align_up(part.size.saturating_sub(start), SECTOR_SIZE);
        debug!(part = %part.name, addr, size, initial, "erase partition");
        if size == 0 {
            return Ok(());
        }
        if !initial {
            self.storage.erase(addr, size)?;
        } else if size > SECTOR_SIZE {
            self.storage
                .erase_initial(addr.saturating_add(SECTOR_SIZE), size.saturating_sub(SECTOR_SIZE))?;
            self.storage.erase_initial(addr, SECTOR_SIZE)?;
        } else {
            self.storage.erase_initial(addr, size)?;
        }
        Ok(())
    }

    fn skips_prepare(&self) -> bool {
        let state = self.journal.state();
        match self.config.install_mode {
            _ if state == BreakpointState::Clean => true,
            InstallMode::RecoveryApp => state == BreakpointState::UpgradeDone,
            InstallMode::Recovery => matches!(
                state,
                BreakpointState::UpgradePending
                    | BreakpointState::UpgradeWriting
                    | BreakpointState::UpgradingFail
            ),
            InstallMode::Mirror => false,
        }
    }

    /// Bring every target partition into a writable state for the journaled
    /// attempt.
    ///
    /// While the journal shows an interrupted write, files that are done or
    /// already clean are kept, and the file under the cursor is erased only
    /// from its last saved offset. Everything else is erased in full.
    pub(super) fn prepare(&mut self) -> Result<(), OtaError> {
        if self.skips_prepare() {
            debug!(state = %self.journal.state(), "prepare skipped");
            return Ok(());
        }
        let state = self.journal.state();
        info!(%state, "prepare");
        self.notify(OtaState::Prepare);

        let resuming = matches!(
            state,
            BreakpointState::UpgradeWriting
                | BreakpointState::WritingImg
                | BreakpointState::UpgradeWritingOther
        );
        let owns_bank = self.config.install_mode.uses_recovery()
            || self.journal.breakpoint().mirror_id == self.table.inactive_mirror();

        for part in self.prepare_targets() {
            if resuming {
                let file_state = self.journal.file_state(part.file_id);
                match file_state {
                    FileState::Clean
                    | FileState::WriteDone
                    | FileState::VerifyPass
                    | FileState::WritingClean => {
                        debug!(part = %part.name, %file_state, "partition kept");
                        continue;
                    }
                    FileState::Writing | FileState::OtherWriting
                        if owns_bank && self.journal.breakpoint().cur_file.file_id == part.file_id =>
                    {
                        self.erase_tail(&part)?;
                        continue;
                    }
                    _ => {}
                }
            }
            self.erase_part(&part, 0, false)?;
            self.journal.set_file_state(part.file_id, FileState::Clean)?;
        }

        self.notify(OtaState::PrepareDone);

        if !matches!(
            state,
            BreakpointState::UpgradeWriting | BreakpointState::WritingImg | BreakpointState::Clean
        ) {
            if state != BreakpointState::Unknown {
                debug!(%state, "journal reset");
                self.journal.reset(Breakpoint::with_defaults(
                    self.platform.current_version().version_code,
                    self.table.inactive_mirror(),
                ));
            }
            self.journal.breakpoint_mut().state = BreakpointState::Clean;
        }
        self.journal.save()?;
        Ok(())
    }

    /// Erase the cursor file's partition from its saved offset, rounded down
    /// to a sector, and resume it as `WritingClean`.
    fn erase_tail(&mut self, part: &PartitionEntry) -> Result<(), OtaError> {
        let bp = self.journal.breakpoint();
        let (file_offset, written) = (bp.cur_file.offset, bp.cur_file_write_offset);
        let erase_offset =
            align_down(file_offset.saturating_add(written), SECTOR_SIZE).saturating_sub(part.offset);
        let write_offset = part
            .offset
            .saturating_add(erase_offset)
            .saturating_sub(file_offset);
        info!(part = %part.name, written, write_offset, "resume, erasing tail");
        self.erase_part(part, erase_offset, false)?;
        self.journal.breakpoint_mut().cur_file_write_offset = write_offset;
        self.journal.set_file_state(part.file_id, FileState::WritingClean)?;
        Ok(())
    }
}
