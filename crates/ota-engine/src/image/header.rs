//! Image head codec
//!
//! ```text
//! 0x000  fixed header (magic, checksums, sizes, offsets)
//! 0x040  target version block
//! 0x0A0  source version block, zero unless the image is a patch
//! 0x200  directory: 16 x 32-byte entries
//! 0x400  payload
//! ```

use ota_errors::ImageError;
use serde::Serialize;

use crate::version::{FirmwareVersion, VERSION_BLOCK_SIZE};
use crate::wire::{ByteReader, ByteWriter, crc32};

/// Image magic ("AOTA" little-endian).
pub const IMAGE_MAGIC: u32 = 0x4154_4F41;

/// Image magic as stored on flash.
pub const IMAGE_MAGIC_BYTES: [u8; 4] = IMAGE_MAGIC.to_le_bytes();

/// Size of the image head.
pub const HEAD_SIZE: usize = 0x400;

/// Offset of the directory inside the head.
pub const DIR_OFFSET: usize = 0x200;

/// Directory capacity.
pub const MAX_DIR_ENTRIES: usize = 16;

/// Encoded directory entry size.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Largest addressable image.
pub const MAX_IMAGE_SIZE: u32 = 0x100_0000;

/// Longest sub-file name.
pub const FILE_NAME_LEN: usize = 12;

/// First byte covered by the header checksum.
const HEAD_CRC_START: usize = 8;
const NEW_VERSION_OFFSET: usize = 0x40;
const OLD_VERSION_OFFSET: usize = 0xA0;

/// One directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Sub-file name, at most 12 bytes
    pub name: String,
    /// Offset from the image start
    pub offset: u32,
    /// Length in bytes
    pub length: u32,
    /// CRC32 of the sub-file
    pub checksum: u32,
}

impl DirEntry {
    /// Entry for `data` stored at `offset`.
    pub fn for_data(name: impl Into<String>, offset: u32, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            offset,
            length: u32::try_from(data.len()).unwrap_or(u32::MAX),
            checksum: crc32(data),
        }
    }

    /// Whether this entry answers to `name`, comparing at most 12 bytes.
    pub fn matches(&self, name: &str) -> bool {
        let a = self.name.as_bytes();
        let b = name.as_bytes();
        a.get(..a.len().min(FILE_NAME_LEN)) == b.get(..b.len().min(FILE_NAME_LEN))
    }
}

/// Parsed image head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    /// Stored header checksum
    pub header_checksum: u32,
    /// Header layout version
    pub header_version: u16,
    /// Attribute flags
    pub flag: u16,
    /// Directory offset
    pub dir_offset: u16,
    /// Payload offset
    pub data_offset: u16,
    /// Total image length
    pub data_size: u32,
    /// CRC32 over `[data_offset, data_size)`
    pub data_checksum: u32,
    /// Target firmware
    pub new_version: FirmwareVersion,
    /// Source firmware for patch images
    pub old_version: Option<FirmwareVersion>,
    /// Sub-file directory
    pub dir: Vec<DirEntry>,
}

impl ImageHeader {
    /// Decode and validate a head.
    ///
    /// # Errors
    ///
    /// - [`ImageError::BadMagic`], [`ImageError::BadHeaderSize`] or
    ///   [`ImageError::TooLarge`] for a malformed fixed header
    /// - [`ImageError::HeaderChecksum`] when the stored CRC does not match
    /// - [`ImageError::TooManyFiles`] for more than 16 directory entries
    pub fn parse(head: &[u8]) -> Result<Self, ImageError> {
        let mut r = ByteReader::new(head);
        let magic = r.u32()?;
        if magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic { found: magic });
        }
        let header_checksum = r.u32()?;
        let header_version = r.u16()?;
        let header_size = r.u16()?;
        if usize::from(header_size) != HEAD_SIZE {
            return Err(ImageError::BadHeaderSize { found: header_size });
        }
        let file_cnt = r.u16()?;
        let flag = r.u16()?;
        let dir_offset = r.u16()?;
        let data_offset = r.u16()?;
        let data_size = r.u32()?;
        let data_checksum = r.u32()?;
        if data_size > MAX_IMAGE_SIZE {
            return Err(ImageError::TooLarge {
                size: data_size,
                max: MAX_IMAGE_SIZE,
            });
        }

        let covered = head.get(HEAD_CRC_START..HEAD_SIZE).ok_or(ImageError::Truncated {
            expected: HEAD_SIZE,
            actual: head.len(),
        })?;
        let actual = crc32(covered);
        if actual != header_checksum {
            return Err(ImageError::HeaderChecksum {
                expected: header_checksum,
                actual,
            });
        }

        if usize::from(file_cnt) > MAX_DIR_ENTRIES {
            return Err(ImageError::TooManyFiles {
                count: file_cnt,
                max: MAX_DIR_ENTRIES,
            });
        }

        let new_version = FirmwareVersion::decode_block(block_at(head, NEW_VERSION_OFFSET)?)?;
        let old_block = block_at(head, OLD_VERSION_OFFSET)?;
        let old_version = if old_block.iter().all(|&b| b == 0) {
            None
        } else {
            Some(FirmwareVersion::decode_block(old_block)?)
        };

        let mut dr = ByteReader::new(head.get(DIR_OFFSET..).unwrap_or_default());
        let mut dir = Vec::with_capacity(usize::from(file_cnt));
        for _ in 0..file_cnt {
            let name = dr.fixed_str(FILE_NAME_LEN)?;
            dr.skip(4)?;
            let offset = dr.u32()?;
            let length = dr.u32()?;
            dr.skip(4)?;
            let checksum = dr.u32()?;
            dir.push(DirEntry {
                name,
                offset,
                length,
                checksum,
            });
        }

        Ok(Self {
            header_checksum,
            header_version,
            flag,
            dir_offset,
            data_offset,
            data_size,
            data_checksum,
            new_version,
            old_version,
            dir,
        })
    }

    /// Encode a 0x400-byte head with a freshly computed header checksum.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::TooManyFiles`] for more than 16 directory entries.
    pub fn encode(&self) -> Result<Vec<u8>, ImageError> {
        if self.dir.len() > MAX_DIR_ENTRIES {
            return Err(ImageError::TooManyFiles {
                count: u16::try_from(self.dir.len()).unwrap_or(u16::MAX),
                max: MAX_DIR_ENTRIES,
            });
        }
        let mut w = ByteWriter::with_capacity(HEAD_SIZE);
        w.u32(IMAGE_MAGIC)
            .u32(0)
            .u16(self.header_version)
            .u16(HEAD_SIZE as u16)
            .u16(self.dir.len() as u16)
            .u16(self.flag)
            .u16(self.dir_offset)
            .u16(self.data_offset)
            .u32(self.data_size)
            .u32(self.data_checksum)
            .pad_to(NEW_VERSION_OFFSET)
            .bytes(&self.new_version.encode_block());
        match &self.old_version {
            Some(old) => w.bytes(&old.encode_block()),
            None => w.zeros(VERSION_BLOCK_SIZE),
        };
        w.pad_to(DIR_OFFSET);
        for entry in &self.dir {
            w.fixed_str(&entry.name, FILE_NAME_LEN)
                .zeros(4)
                .u32(entry.offset)
                .u32(entry.length)
                .zeros(4)
                .u32(entry.checksum);
        }
        w.pad_to(HEAD_SIZE);

        let mut head = w.into_inner();
        let crc = crc32(head.get(HEAD_CRC_START..).unwrap_or_default());
        if let Some(field) = head.get_mut(4..8) {
            field.copy_from_slice(&crc.to_le_bytes());
        }
        Ok(head)
    }

    /// Number of directory entries.
    pub fn file_count(&self) -> usize {
        self.dir.len()
    }
}

fn block_at(head: &[u8], offset: usize) -> Result<&[u8], ImageError> {
    let end = offset.saturating_add(VERSION_BLOCK_SIZE);
    head.get(offset..end).ok_or(ImageError::Truncated {
        expected: end,
        actual: head.len(),
    })
}
