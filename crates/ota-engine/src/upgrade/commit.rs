//! Staging, boot-file commit and version stamping.

use ota_errors::{ImageError, OtaError};
use tracing::{debug, info};

use super::OtaUpgrade;
use crate::breakpoint::{CurrentFile, FileState};
use crate::flash::ENCRYPT_ADDR_FLAG;
use crate::image::IMAGE_MAGIC_BYTES;
use crate::manifest::{Manifest, ManifestFile};
use crate::partition::{PartitionEntry, file_id};
use crate::version::{FW_VERSION_RECORD_SIZE, FwVersionRecord, bump_version_code};

impl OtaUpgrade {
    /// Copy the whole image into the temp partition.
    pub(super) fn write_temp_img(&mut self) -> Result<(), OtaError> {
        let (part, file) = self.temp_file()?;
        if file.size >= part.size {
            return Err(OtaError::FileTooLarge {
                file_id: file_id::OTA_TEMP,
                size: file.size,
                max: part.size,
            });
        }
        self.temp_image_offset = file.offset;
        info!(offset = file.offset, size = file.size, "staging image");
        self.write_and_verify(&part, &file, false)
    }

    /// Write the boot file, then the parameter file, into the partitions the
    /// boot loader reads them from. Both are rewritten from scratch.
    pub(super) fn write_boot_image(&mut self, manifest: &mut Manifest) -> Result<(), OtaError> {
        info!(running = %self.platform.current_version(), "committing boot files");
        let mut boot = None;
        let mut param = None;
        for file in &mut manifest.files {
            let Some(part) = self.table.boot_mirror_part(file.file_id).cloned() else {
                continue;
            };
            let max = part.max_file_size();
            if file.size > max {
                return Err(OtaError::FileTooLarge {
                    file_id: file.file_id,
                    size: file.size,
                    max,
                });
            }
            file.offset = part.file_offset;
            if part.is_boot() {
                boot = Some((part, file.clone()));
            } else if part.is_param() {
                param = Some((part, file.clone()));
            }
        }

        if let Some((part, file)) = boot {
            self.force_rewrite(&file)?;
            self.write_and_verify(&part, &file, true)?;
        }

        if let Some((part, file)) = param {
            if self.config.no_version_control && self.journal.file_state(file.file_id) == FileState::VerifyPass {
                debug!("parameter file already committed");
                return Ok(());
            }
            self.force_rewrite(&file)?;
            self.write_and_verify(&part, &file, true)?;
            if self.config.no_version_control {
                self.auto_update_version(&part, &file)?;
            }
        }
        Ok(())
    }

    fn force_rewrite(&mut self, file: &ManifestFile) -> Result<(), OtaError> {
        self.journal
            .update_file_state(&CurrentFile::from(file), FileState::Unknown, 0, false)?;
        Ok(())
    }

    /// Stamp the written parameter file with the next version after the
    /// running one, so an unversioned image still reads as newer.
    pub(super) fn auto_update_version(&mut self, part: &PartitionEntry, file: &ManifestFile) -> Result<(), OtaError> {
        let mut data = if part.flags.encrypted {
            self.platform
                .map(file.offset, file.size as usize, false)?
                .to_vec()
        } else {
            let mut buf = vec![0u8; file.size as usize];
            self.storage.read(file.offset, &mut buf)?;
            buf
        };

        let at = self.config.param_version_offset as usize;
        let end = at.saturating_add(FW_VERSION_RECORD_SIZE);
        let len = data.len();
        let slot = data.get_mut(at..end).ok_or(ImageError::Truncated {
            expected: end,
            actual: len,
        })?;
        let mut record = FwVersionRecord::decode(slot)?;
        let running = self.platform.current_version().version_code;
        let previous = record.version_code;
        record.version_code = bump_version_code(running);
        record.seal();
        slot.copy_from_slice(&record.encode());
        info!(running, previous, stamped = record.version_code, "version stamped");

        self.erase_part(part, 0, false)?;
        let addr = if part.flags.encrypted {
            file.offset | ENCRYPT_ADDR_FLAG
        } else {
            file.offset
        };
        self.storage.write(addr, &data)?;
        Ok(())
    }

    /// Restore the staged image magic so the boot loader takes it.
    pub(super) fn write_temp_flag(&mut self) -> Result<(), OtaError> {
        let (part, _) = self.temp_file()?;
        let mut flag = [0u8; IMAGE_MAGIC_BYTES.len()];
        self.storage.read(part.offset, &mut flag)?;
        if flag != IMAGE_MAGIC_BYTES {
            debug!(offset = part.offset, "writing staged image flag");
            self.storage.write(part.offset, &IMAGE_MAGIC_BYTES)?;
        }
        Ok(())
    }
}
