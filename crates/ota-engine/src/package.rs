//! Host-side image packaging
//!
//! [`ImagePackager`] lays out an image the engine accepts: the head, the
//! `ota.xml` manifest, then every payload file, each starting on a 16-byte
//! boundary. Patch files carry the command stream in the image while the
//! manifest lists the size and CRC of the rebuilt partition.
//!
//! With a signing key the RSA signature over the SHA-256 of the image is
//! appended after `data_size`, which is where a secure-boot device expects
//! it once the image is staged.

use ota_crypto::ImageSigningKey;
use ota_crypto::utils::compute_sha256;
use ota_errors::{ImageError, ManifestError, OtaError};
use tracing::{debug, info};

use crate::image::header::{DIR_OFFSET, FILE_NAME_LEN, MAX_DIR_ENTRIES};
use crate::image::{DirEntry, HEAD_SIZE, ImageHeader, MAX_IMAGE_SIZE};
use crate::manifest::{MANIFEST_FILE_NAME, Manifest, ManifestFile};
use crate::partition::PartitionType;
use crate::patch::create_patch;
use crate::version::FirmwareVersion;
use crate::wire::crc32;

/// Payload alignment inside the image.
pub const FILE_ALIGN: usize = 16;

/// Header layout version written into new images.
pub const HEADER_VERSION: u16 = 1;

const PAD_BYTE: u8 = 0xFF;

/// One file to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    /// Sub-file name, at most 12 bytes
    pub name: String,
    /// Target partition type
    pub file_type: PartitionType,
    /// Target file id
    pub file_id: u8,
    /// Bytes stored in the image
    pub payload: Vec<u8>,
    /// Size of the file once installed
    pub size: u32,
    /// CRC32 of the file once installed
    pub checksum: u32,
}

/// Builder for update images.
#[derive(Debug)]
pub struct ImagePackager {
    version: FirmwareVersion,
    old_version: Option<FirmwareVersion>,
    files: Vec<PackageFile>,
    signer: Option<ImageSigningKey>,
}

impl ImagePackager {
    /// Start an image installing `version`.
    pub fn new(version: FirmwareVersion) -> Self {
        Self {
            version,
            old_version: None,
            files: Vec::new(),
            signer: None,
        }
    }

    /// Mark the image as a patch against `source`.
    #[must_use]
    pub fn with_old_version(mut self, source: FirmwareVersion) -> Self {
        self.old_version = Some(source);
        self
    }

    /// Append a signature made with `key`.
    #[must_use]
    pub fn with_signer(mut self, key: ImageSigningKey) -> Self {
        self.signer = Some(key);
        self
    }

    /// Add a file installed verbatim.
    #[must_use]
    pub fn file(mut self, name: impl Into<String>, file_type: PartitionType, file_id: u8, data: Vec<u8>) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let checksum = crc32(&data);
        self.files.push(PackageFile {
            name: name.into(),
            file_type,
            file_id,
            payload: data,
            size,
            checksum,
        });
        self
    }

    /// Add a file rebuilt on the device from `old` by a patch.
    #[must_use]
    pub fn patch_file(
        mut self,
        name: impl Into<String>,
        file_type: PartitionType,
        file_id: u8,
        old: &[u8],
        new: &[u8],
    ) -> Self {
        let payload = create_patch(old, new);
        debug!(old = old.len(), new = new.len(), patch = payload.len(), "patch created");
        self.files.push(PackageFile {
            name: name.into(),
            file_type,
            file_id,
            payload,
            size: u32::try_from(new.len()).unwrap_or(u32::MAX),
            checksum: crc32(new),
        });
        self
    }

    /// Files added so far.
    pub fn files(&self) -> &[PackageFile] {
        &self.files
    }

    /// The manifest the image will carry.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            version: self.version.clone(),
            old_version: self.old_version.clone(),
            files: self
                .files
                .iter()
                .map(|f| ManifestFile {
                    name: f.name.clone(),
                    file_type: f.file_type,
                    file_id: f.file_id,
                    size: f.size,
                    checksum: f.checksum,
                    offset: 0,
                })
                .collect(),
        }
    }

    /// Lay out the image.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::NameTooLong`] for a name over 12 bytes
    /// - [`ImageError::TooManyFiles`] past the directory capacity
    /// - [`ImageError::TooLarge`] past the addressable image size
    /// - [`OtaError::Signature`] if signing fails
    pub fn build(&self) -> Result<Vec<u8>, OtaError> {
        if self.files.len() >= MAX_DIR_ENTRIES {
            return Err(ImageError::TooManyFiles {
                count: u16::try_from(self.files.len().saturating_add(1)).unwrap_or(u16::MAX),
                max: MAX_DIR_ENTRIES,
            }
            .into());
        }
        if let Some(long) = self.files.iter().find(|f| f.name.len() > FILE_NAME_LEN) {
            return Err(ManifestError::NameTooLong(long.name.clone()).into());
        }

        let xml = self.manifest().to_xml();
        let mut body: Vec<u8> = Vec::new();
        let mut dir = Vec::with_capacity(self.files.len().saturating_add(1));
        let mut place = |name: &str, data: &[u8]| -> Result<(), ImageError> {
            pad_to_align(&mut body);
            let offset = HEAD_SIZE.saturating_add(body.len());
            let offset = u32::try_from(offset).ok().ok_or_else(|| too_large(offset))?;
            dir.push(DirEntry::for_data(name, offset, data));
            body.extend_from_slice(data);
            Ok(())
        };
        place(MANIFEST_FILE_NAME, xml.as_bytes())?;
        for file in &self.files {
            place(&file.name, &file.payload)?;
        }

        let total = HEAD_SIZE.saturating_add(body.len());
        let data_size = u32::try_from(total)
            .ok()
            .filter(|&size| size <= MAX_IMAGE_SIZE)
            .ok_or_else(|| too_large(total))?;
        let header = ImageHeader {
            header_version: HEADER_VERSION,
            dir_offset: DIR_OFFSET as u16,
            data_offset: HEAD_SIZE as u16,
            data_size,
            data_checksum: crc32(&body),
            new_version: self.version.clone(),
            old_version: self.old_version.clone(),
            dir,
            ..ImageHeader::default()
        };

        let mut image = header.encode()?;
        image.extend_from_slice(&body);
        if let Some(signer) = &self.signer {
            let digest = compute_sha256(&image);
            let signature = signer
                .sign_digest(&digest)
                .map_err(|e| OtaError::signature(e.to_string()))?;
            image.extend_from_slice(&signature);
        }
        info!(
            version = %self.version,
            files = self.files.len(),
            size = data_size,
            signed = self.signer.is_some(),
            patch = self.old_version.is_some(),
            "image packed"
        );
        Ok(image)
    }
}

fn pad_to_align(body: &mut Vec<u8>) {
    let rem = body.len() % FILE_ALIGN;
    if rem != 0 {
        body.resize(body.len().saturating_add(FILE_ALIGN.saturating_sub(rem)), PAD_BYTE);
    }
}

fn too_large(size: usize) -> ImageError {
    ImageError::TooLarge {
        size: u32::try_from(size).unwrap_or(u32::MAX),
        max: MAX_IMAGE_SIZE,
    }
}
