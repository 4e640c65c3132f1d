//! Delta patch engine
//!
//! A patch file rebuilds a partition from the copy the device is running and
//! a stream of commands. It starts with the size of the rebuilt file, encoded
//! in 4 bytes, or in 9 bytes when byte 3 is `0xFF`:
//!
//! ```text
//! short: [b0 b1 b2 b3]                      size = u32 LE, b3 != 0xFF
//! long:  [b0 b1 b2 0xFF b4 b5 b6 b7 b8]     size = b0..b2 | b4 << 24 | (b5..b8) << 32
//! ```
//!
//! The command stream follows:
//!
//! | code | operands                 | effect                               |
//! |------|--------------------------|--------------------------------------|
//! | 0x00 |                          | end of patch                         |
//! | 0x01 | u64 old_pos, u64 len     | copy `len` bytes of the old image    |
//! | 0x02 | u8 byte                  | emit one literal byte                |
//! | 0x03 | u32 len, `len` bytes     | emit a literal run                   |
//!
//! Output goes through a [`PatchOutput`], which only accepts strictly
//! sequential writes. [`GranuleWriter`] lays the output down on flash in
//! 32-byte granules, with CRC framing or encryption as the partition needs.

mod diff;
mod writer;

use std::io::{self, Read};

use ota_errors::{ImageError, OtaError, PatchError};
use tracing::{debug, error, trace};

use crate::image::OtaImage;

pub use diff::{MIN_MATCH, create_patch, encode_size_prefix};
pub use writer::{GranuleWriter, granule_crc};

const CMD_END: u8 = 0x00;
const CMD_COPY: u8 = 0x01;
const CMD_BYTE: u8 = 0x02;
const CMD_LITERAL: u8 = 0x03;

/// Short size prefix length.
pub const SHORT_PREFIX_LEN: usize = 4;

/// Long size prefix length.
pub const LONG_PREFIX_LEN: usize = 9;

const LONG_PREFIX_MARK: u8 = 0xFF;
const LITERAL_FLUSH: usize = 256;
const COPY_CHUNK: usize = 4 * 1024;

/// Sequential sink for rebuilt data.
pub trait PatchOutput {
    /// Write `data` at logical position `pos`.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::NonSequential`] if `pos` is not where the
    /// previous write ended, or the underlying storage error.
    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), OtaError>;
}

impl PatchOutput for Vec<u8> {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), OtaError> {
        let expected = self.len() as u64;
        if pos != expected {
            return Err(PatchError::NonSequential {
                expected,
                actual: pos,
            }
            .into());
        }
        self.extend_from_slice(data);
        Ok(())
    }
}

impl<T: PatchOutput + ?Sized> PatchOutput for &mut T {
    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<(), OtaError> {
        (**self).write_at(pos, data)
    }
}

/// Decode a size prefix, returning the rebuilt size and the prefix length.
///
/// # Errors
///
/// Returns [`PatchError::Failed`] when `prefix` is shorter than the encoding
/// it announces.
pub fn decode_size_prefix(prefix: &[u8]) -> Result<(u64, usize), PatchError> {
    let short = prefix
        .get(..SHORT_PREFIX_LEN)
        .ok_or_else(|| PatchError::failed("size prefix truncated"))?;
    let mut low = [0u8; 4];
    low.copy_from_slice(short);
    let [b0, b1, b2, b3] = low;
    if b3 != LONG_PREFIX_MARK {
        return Ok((u64::from(u32::from_le_bytes(low)), SHORT_PREFIX_LEN));
    }
    let long = prefix
        .get(SHORT_PREFIX_LEN..LONG_PREFIX_LEN)
        .ok_or_else(|| PatchError::failed("long size prefix truncated"))?;
    let mut rest = [0u8; 5];
    rest.copy_from_slice(long);
    let [b4, h0, h1, h2, h3] = rest;
    let low24 = u64::from(u32::from_le_bytes([b0, b1, b2, 0]));
    let high = u64::from(u32::from_le_bytes([h0, h1, h2, h3]));
    Ok((low24 | (u64::from(b4) << 24) | (high << 32), LONG_PREFIX_LEN))
}

/// Read a size prefix from the head of `patch`.
///
/// # Errors
///
/// Returns the stream error, or [`PatchError::Failed`] on a short stream.
pub fn read_size_prefix<R: Read + ?Sized>(patch: &mut R) -> Result<u64, OtaError> {
    let mut prefix = [0u8; LONG_PREFIX_LEN];
    let (short, long) = prefix.split_at_mut(SHORT_PREFIX_LEN);
    read_exact(patch, short)?;
    if short.last() == Some(&LONG_PREFIX_MARK) {
        read_exact(patch, long)?;
    }
    Ok(decode_size_prefix(&prefix)?.0)
}

/// Rebuild a file of `new_size` bytes from `old` and the command stream
/// `patch` into `out`. The size prefix must already have been consumed.
///
/// Returns the number of bytes produced. End of stream counts as an end
/// command.
///
/// # Errors
///
/// - [`PatchError::Failed`] for an unknown command, a truncated operand or a
///   copy outside `old`
/// - [`PatchError::SizeMismatch`] when the output does not come to `new_size`
/// - the error of `patch` or `out`
pub fn apply_patch<R, W>(old: &[u8], patch: &mut R, new_size: u64, out: &mut W) -> Result<u64, OtaError>
where
    R: Read + ?Sized,
    W: PatchOutput + ?Sized,
{
    let mut produced = 0u64;
    let mut literal: Vec<u8> = Vec::with_capacity(LITERAL_FLUSH);
    let mut cmd = [0u8; 1];

    loop {
        match patch.read(&mut cmd) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(stream_error(e)),
        }
        let [code] = cmd;
        match code {
            CMD_END => break,
            CMD_BYTE => {
                let mut byte = [0u8; 1];
                read_exact(patch, &mut byte)?;
                literal.extend_from_slice(&byte);
                if literal.len() >= LITERAL_FLUSH {
                    produced = emit(out, produced, &literal, new_size)?;
                    literal.clear();
                }
            }
            CMD_COPY => {
                produced = emit(out, produced, &literal, new_size)?;
                literal.clear();
                let old_pos = read_u64(patch)?;
                let len = read_u64(patch)?;
                let range = old_range(old.len(), old_pos, len)?;
                trace!(old_pos, len, "patch copy");
                let source = old.get(range).unwrap_or_default();
                for chunk in source.chunks(COPY_CHUNK) {
                    produced = emit(out, produced, chunk, new_size)?;
                }
            }
            CMD_LITERAL => {
                produced = emit(out, produced, &literal, new_size)?;
                literal.clear();
                let mut len = [0u8; 4];
                read_exact(patch, &mut len)?;
                let mut remaining = u32::from_le_bytes(len) as usize;
                let mut buf = vec![0u8; remaining.min(COPY_CHUNK)];
                while remaining > 0 {
                    let chunk = buf.get_mut(..remaining.min(COPY_CHUNK)).unwrap_or_default();
                    read_exact(patch, chunk)?;
                    produced = emit(out, produced, chunk, new_size)?;
                    remaining = remaining.saturating_sub(chunk.len());
                }
            }
            other => {
                error!(command = other, produced, "unknown patch command");
                return Err(PatchError::failed(format!("unknown command {other:#04x}")).into());
            }
        }
    }
    produced = emit(out, produced, &literal, new_size)?;

    if produced != new_size {
        return Err(PatchError::SizeMismatch {
            expected: new_size,
            actual: produced,
        }
        .into());
    }
    debug!(produced, "patch applied");
    Ok(produced)
}

fn emit<W: PatchOutput + ?Sized>(out: &mut W, pos: u64, data: &[u8], limit: u64) -> Result<u64, OtaError> {
    if data.is_empty() {
        return Ok(pos);
    }
    let next = pos.saturating_add(data.len() as u64);
    if next > limit {
        return Err(PatchError::SizeMismatch {
            expected: limit,
            actual: next,
        }
        .into());
    }
    out.write_at(pos, data)?;
    Ok(next)
}

fn old_range(old_len: usize, pos: u64, len: u64) -> Result<std::ops::Range<usize>, PatchError> {
    let start = usize::try_from(pos).ok();
    let end = pos.checked_add(len).and_then(|e| usize::try_from(e).ok());
    match (start, end) {
        (Some(start), Some(end)) if end <= old_len => Ok(start..end),
        _ => Err(PatchError::failed(format!(
            "copy of {len} bytes at {pos:#x} outside old image of {old_len} bytes"
        ))),
    }
}

fn read_u64<R: Read + ?Sized>(patch: &mut R) -> Result<u64, OtaError> {
    let mut buf = [0u8; 8];
    read_exact(patch, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_exact<R: Read + ?Sized>(patch: &mut R, buf: &mut [u8]) -> Result<(), OtaError> {
    patch.read_exact(buf).map_err(stream_error)
}

/// Map a stream error back to the image error it carries, if any.
fn stream_error(e: io::Error) -> OtaError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        return PatchError::failed("patch stream truncated").into();
    }
    let message = e.to_string();
    match e.into_inner().map(|inner| inner.downcast::<ImageError>()) {
        Some(Ok(image)) => OtaError::Image(*image),
        _ => PatchError::failed(message).into(),
    }
}

/// [`Read`] adapter over one sub-file of an open [`OtaImage`].
#[derive(Debug)]
pub struct ImagePatchReader<'a> {
    image: &'a mut OtaImage,
    offset: u32,
    end: u32,
    chunk: usize,
}

impl<'a> ImagePatchReader<'a> {
    /// Reader over `len` bytes at image offset `offset`.
    pub fn new(image: &'a mut OtaImage, offset: u32, len: u32) -> Self {
        Self {
            image,
            offset,
            end: offset.saturating_add(len),
            chunk: COPY_CHUNK,
        }
    }

    /// Cap each transport read at `chunk` bytes.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u32 {
        self.end.saturating_sub(self.offset)
    }
}

impl Read for ImagePatchReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.remaining() as usize).min(self.chunk);
        if len == 0 {
            return Ok(0);
        }
        let dst = buf.get_mut(..len).unwrap_or_default();
        self.image.read(self.offset, dst).map_err(io::Error::other)?;
        self.offset = self.offset.saturating_add(len as u32);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(pos: u64, len: u64) -> Vec<u8> {
        let mut cmd = vec![CMD_COPY];
        cmd.extend_from_slice(&pos.to_le_bytes());
        cmd.extend_from_slice(&len.to_le_bytes());
        cmd
    }

    #[test]
    fn test_short_and_long_prefix() -> Result<(), PatchError> {
        assert_eq!(decode_size_prefix(&[0x10, 0x20, 0x00, 0x00])?, (0x2010, 4));
        assert_eq!(
            decode_size_prefix(&[0x01, 0x02, 0x03, 0xFF, 0xAB, 0x05, 0, 0, 0])?,
            (0x5_AB03_0201, 9)
        );
        assert!(decode_size_prefix(&[0x01, 0x02, 0x03, 0xFF, 0xAB]).is_err());
        assert!(decode_size_prefix(&[0x01]).is_err());
        Ok(())
    }

    #[test]
    fn test_apply_copy_and_literals() -> Result<(), OtaError> {
        let old = b"hello world, hello patch".to_vec();
        let mut patch = copy(0, 6);
        patch.extend_from_slice(&[CMD_BYTE, b'n', CMD_BYTE, b'e', CMD_BYTE, b'w']);
        patch.push(CMD_LITERAL);
        patch.extend_from_slice(&2u32.to_le_bytes());
        patch.extend_from_slice(b", ");
        patch.extend_from_slice(&copy(19, 5));
        patch.push(CMD_END);

        let mut out = Vec::new();
        let produced = apply_patch(&old, &mut patch.as_slice(), 16, &mut out)?;
        assert_eq!(produced, 16);
        assert_eq!(out, b"hello new, patch");
        Ok(())
    }

    #[test]
    fn test_copy_outside_old_is_rejected() {
        let patch = copy(4, 8);
        let mut out = Vec::new();
        let err = apply_patch(&[0u8; 10], &mut patch.as_slice(), 8, &mut out);
        assert!(matches!(err, Err(OtaError::Patch(PatchError::Failed(_)))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_size_mismatch() {
        let patch = [CMD_BYTE, 1, CMD_BYTE, 2, CMD_END];
        let mut out = Vec::new();
        assert!(matches!(
            apply_patch(&[], &mut patch.as_slice(), 3, &mut out),
            Err(OtaError::Patch(PatchError::SizeMismatch {
                expected: 3,
                actual: 2
            }))
        ));

        let mut out = Vec::new();
        assert!(matches!(
            apply_patch(&[], &mut patch.as_slice(), 1, &mut out),
            Err(OtaError::Patch(PatchError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_unknown_command_and_truncation() {
        let mut out = Vec::new();
        assert!(apply_patch(&[], &mut [0x7Fu8].as_slice(), 0, &mut out).is_err());
        let truncated = [CMD_COPY, 0, 0];
        assert!(matches!(
            apply_patch(&[], &mut truncated.as_slice(), 0, &mut out),
            Err(OtaError::Patch(PatchError::Failed(_)))
        ));
    }

    #[test]
    fn test_vec_output_is_sequential() {
        let mut out = Vec::new();
        assert!(out.write_at(0, b"ab").is_ok());
        assert!(matches!(
            out.write_at(5, b"cd"),
            Err(OtaError::Patch(PatchError::NonSequential {
                expected: 2,
                actual: 5
            }))
        ));
    }

    #[test]
    fn test_image_error_survives_the_stream() {
        let err = stream_error(io::Error::other(ImageError::Timeout { offset: 0x40 }));
        assert!(matches!(err, OtaError::Image(ImageError::Timeout { offset: 0x40 })));
        assert!(err.is_resumable());
    }

    #[test]
    fn test_read_size_prefix_consumes_only_the_prefix() -> Result<(), OtaError> {
        let bytes = [0x03, 0x00, 0x00, 0x00, CMD_BYTE];
        let mut stream = bytes.as_slice();
        assert_eq!(read_size_prefix(&mut stream)?, 3);
        assert_eq!(stream, &[CMD_BYTE]);
        Ok(())
    }
}
