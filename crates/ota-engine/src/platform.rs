//! Board services the engine consumes
//!
//! [`Platform`] reports the running firmware version and provides temporary
//! read-only mappings of flash. A mapping of a CRC-framed partition yields
//! the logical bytes with the 2-byte record checksums stripped; a mapping of
//! an encrypted partition yields decrypted bytes.

use std::borrow::Cow;
use std::ops::Deref;

use ota_errors::StorageError;

use crate::version::FirmwareVersion;

/// A scoped read-only view of flash contents.
///
/// The mapping is released when the region is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion<'a> {
    offset: u32,
    bytes: Cow<'a, [u8]>,
}

impl<'a> MappedRegion<'a> {
    /// View over borrowed bytes.
    pub fn borrowed(offset: u32, bytes: &'a [u8]) -> Self {
        Self {
            offset,
            bytes: Cow::Borrowed(bytes),
        }
    }

    /// View over a copy of the bytes.
    pub fn owned(offset: u32, bytes: Vec<u8>) -> Self {
        Self {
            offset,
            bytes: Cow::Owned(bytes),
        }
    }

    /// Physical start address of the mapping.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Mapped bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for MappedRegion<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for MappedRegion<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Board services.
pub trait Platform: Send + Sync {
    /// Version of the firmware currently running.
    fn current_version(&self) -> FirmwareVersion;

    /// Map `len` logical bytes of flash starting at physical `offset`.
    ///
    /// With `crc_framed` set the region is read as 34-byte records and only
    /// the 32 payload bytes of each are returned.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the range cannot be mapped.
    fn map(&self, offset: u32, len: usize, crc_framed: bool) -> Result<MappedRegion<'_>, StorageError>;
}

/// Strip CRC framing from `physical`, returning at most `len` payload bytes.
pub fn deframe(physical: &[u8], len: usize) -> Vec<u8> {
    let record = crate::partition::CRC_RECORD_SIZE as usize;
    let payload = crate::partition::CRC_PAYLOAD_SIZE as usize;
    let mut out = Vec::with_capacity(len);
    for chunk in physical.chunks(record) {
        if out.len() >= len {
            break;
        }
        let data = chunk.get(..payload.min(chunk.len())).unwrap_or_default();
        let take = data.len().min(len.saturating_sub(out.len()));
        out.extend_from_slice(data.get(..take).unwrap_or_default());
    }
    out
}

/// Physical bytes needed to hold `len` logical bytes with CRC framing.
pub fn framed_len(len: usize) -> usize {
    let record = crate::partition::CRC_RECORD_SIZE as usize;
    let payload = crate::partition::CRC_PAYLOAD_SIZE as usize;
    len.div_ceil(payload).saturating_mul(record)
}
