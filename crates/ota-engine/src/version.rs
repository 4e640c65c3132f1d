//! Firmware version model
//!
//! Two encodings exist. The image head carries a 0x60-byte version block for
//! the target (and, for patches, the source) firmware. The parameter file
//! carries a 128-byte [`FwVersionRecord`] that the boot loader trusts; the
//! engine rewrites it when version control is disabled.

use ota_errors::ImageError;
use serde::{Deserialize, Serialize};

use crate::wire::{ByteReader, ByteWriter, crc32};

/// Encoded size of an image-head version block.
pub const VERSION_BLOCK_SIZE: usize = 0x60;

/// Encoded size of the parameter-file version record.
pub const FW_VERSION_RECORD_SIZE: usize = 128;

/// Magic of the parameter-file version record ("FVER").
pub const FW_VERSION_MAGIC: u32 = 0x5245_5646;

const BLOCK_NAME_LEN: usize = 32;
const BLOCK_BOARD_LEN: usize = 32;
const RECORD_NAME_LEN: usize = 64;
const RECORD_BOARD_LEN: usize = 32;

/// A firmware version as carried by images and manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Packed numeric version; compared as a plain integer
    pub version_code: u32,
    /// Human readable version
    pub version_name: String,
    /// Board the firmware is built for
    pub board_name: String,
}

impl FirmwareVersion {
    /// Build a version.
    pub fn new(version_code: u32, version_name: impl Into<String>, board_name: impl Into<String>) -> Self {
        Self {
            version_code,
            version_name: version_name.into(),
            board_name: board_name.into(),
        }
    }

    /// Decode a 0x60-byte version block.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Truncated`] if `block` is short.
    pub fn decode_block(block: &[u8]) -> Result<Self, ImageError> {
        let mut r = ByteReader::new(block);
        let version_name = r.fixed_str(BLOCK_NAME_LEN)?;
        let board_name = r.fixed_str(BLOCK_BOARD_LEN)?;
        r.skip(4)?;
        let version_code = r.u32()?;
        r.skip(8 + 16)?;
        Ok(Self {
            version_code,
            version_name,
            board_name,
        })
    }

    /// Encode as a 0x60-byte version block. Names are truncated to 32 bytes.
    pub fn encode_block(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(VERSION_BLOCK_SIZE);
        w.fixed_str(&self.version_name, BLOCK_NAME_LEN)
            .fixed_str(&self.board_name, BLOCK_BOARD_LEN)
            .zeros(4)
            .u32(self.version_code)
            .zeros(8 + 16);
        w.into_inner()
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({:#08x}) for {}",
            self.version_name, self.version_code, self.board_name
        )
    }
}

/// Version record stored inside the parameter file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwVersionRecord {
    /// Packed numeric version
    pub version_code: u32,
    /// Reserved version word
    pub version_res: u32,
    /// System firmware version code
    pub system_version_code: u32,
    /// Human readable version
    pub version_name: String,
    /// Board name
    pub board_name: String,
    /// Stored checksum
    pub checksum: u32,
}

impl FwVersionRecord {
    /// Decode a 128-byte record. The checksum is returned as stored; see
    /// [`is_valid`](Self::is_valid).
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Truncated`] for a short buffer or
    /// [`ImageError::BadMagic`] when the magic does not match.
    pub fn decode(buf: &[u8]) -> Result<Self, ImageError> {
        let mut r = ByteReader::new(buf);
        let magic = r.u32()?;
        if magic != FW_VERSION_MAGIC {
            return Err(ImageError::BadMagic { found: magic });
        }
        let version_code = r.u32()?;
        let version_res = r.u32()?;
        let system_version_code = r.u32()?;
        let version_name = r.fixed_str(RECORD_NAME_LEN)?;
        let board_name = r.fixed_str(RECORD_BOARD_LEN)?;
        r.skip(12)?;
        let checksum = r.u32()?;
        Ok(Self {
            version_code,
            version_res,
            system_version_code,
            version_name,
            board_name,
            checksum,
        })
    }

    /// Encode without touching the stored checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(FW_VERSION_RECORD_SIZE);
        w.u32(FW_VERSION_MAGIC)
            .u32(self.version_code)
            .u32(self.version_res)
            .u32(self.system_version_code)
            .fixed_str(&self.version_name, RECORD_NAME_LEN)
            .fixed_str(&self.board_name, RECORD_BOARD_LEN)
            .zeros(12)
            .u32(self.checksum);
        w.into_inner()
    }

    /// Checksum over the first 124 encoded bytes.
    pub fn compute_checksum(&self) -> u32 {
        let bytes = self.encode();
        crc32(bytes.get(..FW_VERSION_RECORD_SIZE.saturating_sub(4)).unwrap_or_default())
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Whether the stored checksum matches the contents.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// The firmware version this record describes.
    pub fn firmware_version(&self) -> FirmwareVersion {
        FirmwareVersion::new(self.version_code, &self.version_name, &self.board_name)
    }
}

/// Next version code after `running`, keeping every byte field of the packed
/// code below 0x64 so each field reads as a base-100 digit pair.
///
/// Each field is checked twice, low to high.
pub fn bump_version_code(running: u32) -> u32 {
    let mut v = running.wrapping_add(1);
    for (mask, limit, carry) in [
        (0xFFu32, 0x64u32, 0x9Cu32),
        (0xFF00, 0x6400, 0x9C00),
        (0xFF_0000, 0x64_0000, 0x9C_0000),
    ] {
        for _ in 0..2 {
            if v & mask >= limit {
                v = v.wrapping_add(carry);
            }
        }
    }
    v
}
