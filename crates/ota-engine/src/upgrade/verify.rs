//! Read-back verification of written files.

use ota_errors::OtaError;
use tracing::{debug, error, info, warn};

use super::{OtaUpgrade, TEMP_FILE_NAME};
use crate::breakpoint::{CurrentFile, FileState};
use crate::event::OtaState;
use crate::flash::{SECTOR_SIZE, align_down};
use crate::manifest::ManifestFile;
use crate::partition::{PartitionEntry, PartitionType, file_id};
use crate::wire::crc32;

impl OtaUpgrade {
    /// Check `file` as it now sits in `part`.
    ///
    /// Plain files are checked by CRC32 over flash. Encrypted files and
    /// patch output on CRC-framed partitions are checked over the platform
    /// mapping, which decrypts and strips framing. The staged image is
    /// checked as a whole image, by signature under secure boot.
    pub(super) fn verify_file(&mut self, part: &PartitionEntry, file: &ManifestFile) -> Result<(), OtaError> {
        if file.file_id == file_id::OTA_TEMP {
            return self.verify_staged(file);
        }
        let framed = self.patch_image && part.flags.crc;
        let actual = if framed || part.flags.encrypted {
            let region = self.platform.map(file.offset, file.size as usize, framed)?;
            crc32(&region)
        } else {
            self.storage.calc_crc(file.offset, file.size)?
        };
        if actual != file.checksum {
            error!(expected = file.checksum, actual, "checksum mismatch");
            return Err(OtaError::VerifyFailed {
                file: file.name.clone(),
                expected: file.checksum,
                actual,
            });
        }
        debug!(checksum = actual, "checksum pass");
        Ok(())
    }

    /// Verify the staged image, erasing its first sector on failure so the
    /// boot loader never picks it up.
    fn verify_staged(&mut self, file: &ManifestFile) -> Result<(), OtaError> {
        let result = match &self.key {
            Some(key) => {
                let sig_len = self.config.signature_len;
                let body = file.size.saturating_sub(sig_len);
                let signed = self.storage.check_image_signature(
                    key,
                    file.offset,
                    body,
                    file.offset.saturating_add(body),
                    sig_len as usize,
                )?;
                if signed {
                    Ok(())
                } else {
                    Err(OtaError::signature("staged image signature does not verify"))
                }
            }
            None => self.storage.check_image(file.offset),
        };
        if let Err(e) = &result {
            warn!(error = %e, offset = file.offset, "staged image rejected, erasing head");
            self.storage
                .erase(align_down(file.offset, SECTOR_SIZE), SECTOR_SIZE)?;
        }
        result
    }

    /// The staged image as a file.
    pub(super) fn temp_file(&self) -> Result<(PartitionEntry, ManifestFile), OtaError> {
        let part = self
            .table
            .temp_part()
            .cloned()
            .ok_or(OtaError::UnknownPartition {
                file_id: file_id::OTA_TEMP,
            })?;
        let file = ManifestFile {
            name: TEMP_FILE_NAME.to_string(),
            file_type: PartitionType::Temp,
            file_id: file_id::OTA_TEMP,
            size: self.temp_image_size()?,
            checksum: 0,
            offset: part.offset,
        };
        Ok((part, file))
    }

    /// Verify the image staged by a recovery install.
    pub(super) fn verify_temp_image(&mut self) -> Result<(), OtaError> {
        let (_, file) = self.temp_file()?;
        let cur = CurrentFile::from(&file);
        self.notify(OtaState::FileVerify);
        let result = self.verify_staged(&file);
        self.notify(OtaState::FileVerifyDone);
        match result {
            Ok(()) => {
                info!(size = file.size, "staged image verified");
                self.journal.update_file_state(&cur, FileState::VerifyPass, 0, false)?;
                Ok(())
            }
            Err(e) => {
                if let Err(save) = self.journal.update_file_state(&cur, FileState::VerifyFail, 0, false) {
                    error!(error = %save, "verify failure not saved");
                }
                Err(e)
            }
        }
    }
}
