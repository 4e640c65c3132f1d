//! Writing files: plain copies through the transfer pipeline, or patches
//! rebuilt against the running firmware.

use std::sync::Arc;

use ota_errors::{ImageError, OtaError, PatchError, StorageError};
use tracing::{debug, error, info, info_span, warn};

use super::OtaUpgrade;
use crate::breakpoint::{CurrentFile, FileState};
use crate::config::InstallMode;
use crate::event::OtaState;
use crate::flash::{ENCRYPT_ADDR_FLAG, ERASED_BYTE, SECTOR_SIZE, align_down};
use crate::manifest::{Manifest, ManifestFile};
use crate::partition::{CRC_PAYLOAD_SIZE, PartitionEntry, file_id};
use crate::patch::{GranuleWriter, ImagePatchReader, apply_patch, read_size_prefix};
use crate::pipeline::{ChunkSource, TransferPlan, transfer};
use crate::platform::framed_len;

/// Encrypted partitions are programmed in whole cipher blocks.
const ENCRYPT_UNIT: usize = CRC_PAYLOAD_SIZE as usize;

/// Leading bytes of a staged image held erased until commit.
const STAGED_MAGIC_LEN: usize = 4;

/// Where a file starts and whether its destination must be erased first.
#[derive(Debug, Clone, Copy)]
struct Resume {
    start: u32,
    need_erase: bool,
}

impl OtaUpgrade {
    /// Destination partition for `file_id`.
    ///
    /// Without an inactive-bank copy, recovery installs fall back to the
    /// single live copy unless it holds the running firmware; those files are
    /// skipped (`None`). Mirror installs treat a missing copy as an error.
    pub(super) fn resolve_part(&self, file_id: u8) -> Result<Option<PartitionEntry>, OtaError> {
        if let Some(part) = self.table.mirror_part(file_id) {
            return Ok(Some(part.clone()));
        }
        if !self.config.install_mode.uses_recovery() {
            error!(file_id, "no mirror partition");
            return Err(OtaError::UnknownPartition { file_id });
        }
        let current = self.table.current_file_id();
        match self.table.find(file_id) {
            Some(part) if file_id != current => Ok(Some(part.clone())),
            _ => {
                warn!(file_id, current, "no writable partition, file skipped");
                Ok(None)
            }
        }
    }

    /// Size of the staged image: the whole image plus its signature.
    pub(super) fn temp_image_size(&self) -> Result<u32, OtaError> {
        let data_size = self.image.header().ok_or(ImageError::NotOpen)?.data_size;
        if self.config.secure_boot() {
            Ok(data_size.saturating_add(self.config.signature_len))
        } else {
            Ok(data_size)
        }
    }

    fn resume_offset(&self, file_id: u8, state: FileState) -> u32 {
        let bp = self.journal.breakpoint();
        let resumable = matches!(state, FileState::WritingClean | FileState::Writing);
        if resumable && bp.cur_file.file_id == file_id {
            bp.cur_file_write_offset
        } else {
            0
        }
    }

    /// Start progress accounting from the journal: bytes of finished files
    /// and of the resumed prefix count as already transferred.
    pub(super) fn statistics(&mut self, manifest: &Manifest) -> Result<(), OtaError> {
        let (mut total, mut remaining) = (0u32, 0u32);
        if self.config.install_mode.writes_partitions() {
            for file in &manifest.files {
                if self.resolve_part(file.file_id)?.is_none() {
                    continue;
                }
                let state = self.journal.file_state(file.file_id);
                let start = self.resume_offset(file.file_id, state);
                if !state.is_done() {
                    remaining = remaining.saturating_add(file.size.saturating_sub(start));
                }
                total = total.saturating_add(file.size);
                debug!(file = %file.name, size = file.size, start, "statistics");
            }
        } else {
            let state = self.journal.file_state(file_id::OTA_TEMP);
            if !state.is_done() {
                let start = self.resume_offset(file_id::OTA_TEMP, state);
                let size = self.temp_image_size()?;
                remaining = size.saturating_sub(start);
                total = size;
            }
        }
        if remaining > 0 {
            self.image.progress_on(total, remaining);
        }
        Ok(())
    }

    /// Write every manifest file into its partition, boot and parameter files
    /// last, verifying each as soon as it is written.
    pub(super) fn do_upgrade(&mut self, manifest: &mut Manifest) -> Result<(), OtaError> {
        let mut deferred: Vec<(PartitionEntry, ManifestFile)> = Vec::new();
        for file in &mut manifest.files {
            let Some(part) = self.resolve_part(file.file_id)? else {
                continue;
            };
            let max = part.max_file_size();
            if file.size > max {
                error!(file = %file.name, size = file.size, max, "file does not fit");
                return Err(OtaError::FileTooLarge {
                    file_id: file.file_id,
                    size: file.size,
                    max,
                });
            }
            file.offset = part.file_offset;
            if part.is_boot() || part.is_param() {
                debug!(file = %file.name, "deferred");
                deferred.push((part, file.clone()));
                continue;
            }
            self.write_and_verify(&part, file, true)?;
        }

        deferred.sort_by_key(|(part, _)| part.is_param());
        for (part, file) in &deferred {
            self.write_and_verify(part, file, true)?;
        }
        if self.config.no_version_control
            && let Some((part, file)) = deferred.iter().find(|(part, _)| part.is_param())
        {
            self.auto_update_version(part, file)?;
        }
        Ok(())
    }

    fn plan_resume(&self, file: &ManifestFile, state: FileState) -> Resume {
        let on_cursor = self.journal.breakpoint().cur_file.file_id == file.file_id;
        let start = self.resume_offset(file.file_id, state);
        match state {
            FileState::WriteDone | FileState::VerifyPass | FileState::OtherWriting | FileState::Clean => Resume {
                start: 0,
                need_erase: false,
            },
            FileState::WritingClean if on_cursor => Resume {
                start,
                need_erase: false,
            },
            FileState::Writing if on_cursor => Resume {
                start,
                need_erase: true,
            },
            _ => Resume {
                start: 0,
                need_erase: true,
            },
        }
    }

    /// Write `file` into `part` unless the journal says it is done, then
    /// verify it when asked.
    ///
    /// A non-resumable failure marks the file `WriteFail` (or `VerifyFail`),
    /// so the next prepare erases it.
    pub(super) fn write_and_verify(
        &mut self,
        part: &PartitionEntry,
        file: &ManifestFile,
        verify: bool,
    ) -> Result<(), OtaError> {
        let span = info_span!("file", name = %file.name, file_id = file.file_id);
        let _enter = span.enter();
        let cur = CurrentFile::from(file);
        let state = self.journal.file_state(file.file_id);
        info!(%state, offset = file.offset, size = file.size, "write file");

        let result = self.write_and_verify_stages(part, file, &cur, state, verify);
        if let Err(e) = &result
            && !e.is_resumable()
            && self.journal.file_state(file.file_id) != FileState::VerifyFail
            && let Err(save) = self.journal.update_file_state(&cur, FileState::WriteFail, 0, false)
        {
            error!(error = %save, "write failure not saved");
        }
        result
    }

    fn write_and_verify_stages(
        &mut self,
        part: &PartitionEntry,
        file: &ManifestFile,
        cur: &CurrentFile,
        state: FileState,
        verify: bool,
    ) -> Result<(), OtaError> {
        let Resume { mut start, need_erase } = self.plan_resume(file, state);

        let storage_id = self.storage.storage_id();
        if part.storage_id != storage_id {
            error!(part = %part.name, storage = part.storage_id, bound = storage_id, "storage mismatch");
            return Err(OtaError::StorageMismatch {
                file_id: file.file_id,
                expected: storage_id,
                actual: part.storage_id,
            });
        }

        if need_erase {
            let erase_from = align_down(file.offset.saturating_add(start), SECTOR_SIZE);
            start = erase_from.saturating_sub(file.offset);
            self.erase_part(part, erase_from.saturating_sub(part.offset), false)?;
            debug!(start, "destination erased");
            self.journal.breakpoint_mut().cur_file_write_offset = start;
        }

        if !self.breakpoint_reported {
            self.breakpoint_reported = true;
            if start > 0 || state.is_done() {
                info!(start, %state, "resuming interrupted upgrade");
                self.notify(OtaState::BreakpointReport);
            }
        }

        if !state.is_done() {
            self.journal.update_file_state(cur, FileState::WriteStart, start, false)?;
            self.notify(OtaState::FileWrite);
            let written = if self.patch_image && file.file_id != file_id::OTA_TEMP {
                self.write_file_by_patch(part, file, cur, start)
            } else {
                self.write_file_normal(part, file, cur, start)
            };
            self.notify(OtaState::FileWriteDone);
            written?;
            self.journal.update_file_state(cur, FileState::WriteDone, 0, false)?;
        }

        if verify {
            self.notify(OtaState::FileVerify);
            let verified = self.verify_file(part, file);
            self.notify(OtaState::FileVerifyDone);
            if let Err(e) = verified {
                error!(error = %e, "verify failed");
                self.journal.update_file_state(cur, FileState::VerifyFail, 0, false)?;
                return Err(e);
            }
            info!("verify pass");
            self.journal.update_file_state(cur, FileState::VerifyPass, 0, false)?;
        }
        Ok(())
    }

    fn transfer_plan(&self, offset: u32, len: u32, align: usize) -> TransferPlan {
        let unit = self.image.write_unit().max(1) as usize;
        let limit = self
            .image
            .max_request_size()
            .map_or(self.config.max_request_size, |m| m.min(self.config.max_request_size));
        let request = self.config.data_buffer_size.min(limit as usize);
        TransferPlan {
            offset,
            len,
            request: (request / unit).saturating_mul(unit).max(unit),
            in_buffer: self.config.in_buffer_size,
            ring_capacity: self.config.rx_buffer_size,
            align,
        }
    }

    /// Copy `file` from its source to flash starting at `start`, journaling
    /// the written prefix as it grows.
    ///
    /// Boot and parameter files of a recovery install are read from the
    /// staged image instead of the transport.
    fn write_file_normal(
        &mut self,
        part: &PartitionEntry,
        file: &ManifestFile,
        cur: &CurrentFile,
        start: u32,
    ) -> Result<(), OtaError> {
        if start >= file.size {
            error!(start, size = file.size, "write offset past end of file");
            return Err(ImageError::OutOfBounds {
                offset: start,
                len: 0,
                size: file.size,
            }
            .into());
        }

        let staging = file.file_id == file_id::OTA_TEMP;
        let from_staged = self.config.install_mode == InstallMode::Recovery && !staging;
        let source_offset = if staging {
            self.image.file_offset(None)?
        } else {
            self.image.file_offset(Some(&file.name))?
        };
        let encrypted = part.flags.encrypted && self.config.install_mode == InstallMode::RecoveryApp;
        let align = if encrypted { ENCRYPT_UNIT } else { 1 };
        let plan = self.transfer_plan(source_offset.saturating_add(start), file.size.saturating_sub(start), align);
        info!(source_offset, start, len = plan.len, from_staged, encrypted, "transfer");

        let prepared = self.image.supports_prepared_reads();
        let segment = self.config.read_segment;
        let platform = Arc::clone(&self.platform);
        let source = if from_staged {
            ChunkSource::Staged {
                platform: platform.as_ref(),
                base: self.temp_image_offset,
            }
        } else {
            ChunkSource::Image {
                image: &mut self.image,
                prepared,
                segment,
            }
        };

        let storage = &mut self.storage;
        let journal = &mut self.journal;
        let base = file.offset;
        let mut first = true;
        let mut written = start;
        let result = transfer(source, plan, |rel, data| {
            let offs = start.saturating_add(rel);
            journal.update_file_state(cur, FileState::Writing, offs, first)?;
            first = false;

            let mut addr = base.saturating_add(offs);
            if encrypted {
                if data.len() % ENCRYPT_UNIT != 0 {
                    return Err(StorageError::Misaligned {
                        offset: addr,
                        len: data.len() as u32,
                        align: ENCRYPT_UNIT as u32,
                    }
                    .into());
                }
                addr |= ENCRYPT_ADDR_FLAG;
            }
            if staging && offs == 0 {
                let mut chunk = data.to_vec();
                if let Some(head) = chunk.get_mut(..STAGED_MAGIC_LEN) {
                    head.fill(ERASED_BYTE);
                }
                storage.write(addr, &chunk)?;
            } else {
                storage.write(addr, data)?;
            }
            written = offs.saturating_add(data.len() as u32);
            Ok(())
        });

        if let Err(e) = &result
            && e.is_resumable()
        {
            warn!(error = %e, written, "transfer interrupted");
            self.journal.update_file_state(cur, FileState::Writing, written, true)?;
        }
        result
    }

    /// Rebuild `file` from the running copy of its partition and the patch
    /// stored under its name. Patch output cannot be resumed.
    fn write_file_by_patch(
        &mut self,
        part: &PartitionEntry,
        file: &ManifestFile,
        cur: &CurrentFile,
        start: u32,
    ) -> Result<(), OtaError> {
        if start != 0 {
            return Err(PatchError::ResumeUnsupported { offset: start }.into());
        }
        let physical = if part.flags.crc {
            u32::try_from(framed_len(file.size as usize)).unwrap_or(u32::MAX)
        } else {
            file.size
        };
        if !self.storage.is_clean(file.offset, physical)? {
            error!(offset = file.offset, "patch target not clean");
            return Err(PatchError::TargetNotClean { offset: file.offset }.into());
        }
        self.journal.update_file_state(cur, FileState::WritingDirty, 0, false)?;

        let source = self
            .table
            .find(file.file_id)
            .cloned()
            .ok_or(OtaError::UnknownPartition { file_id: file.file_id })?;
        let target_end = file.offset.saturating_add(physical);
        if source.offset < target_end && file.offset < source.end() {
            return Err(PatchError::SourceAliasesTarget {
                source_offset: source.offset,
                target_offset: file.offset,
            }
            .into());
        }

        let platform = Arc::clone(&self.platform);
        let old = platform.map(source.file_offset, source.max_file_size() as usize, source.flags.crc)?;
        let patch_offset = self.image.file_offset(Some(&file.name))?;
        let patch_len = self.image.file_length(Some(&file.name))?;
        info!(
            source = %source.name,
            old_len = old.len(),
            patch_len,
            "applying patch"
        );

        let mut reader = ImagePatchReader::new(&mut self.image, patch_offset, patch_len)
            .with_chunk(self.config.data_buffer_size);
        let new_size = read_size_prefix(&mut reader)?;
        if new_size != u64::from(file.size) {
            return Err(PatchError::SizeMismatch {
                expected: u64::from(file.size),
                actual: new_size,
            }
            .into());
        }
        let mut writer = GranuleWriter::new(&mut self.storage, file.offset, part.flags);
        apply_patch(&old, &mut reader, new_size, &mut writer)?;
        let produced = writer.finish()?;
        debug!(produced, "patch applied");
        Ok(())
    }
}
