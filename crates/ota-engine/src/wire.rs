//! Little-endian cursor helpers for the fixed-layout on-flash records.

use ota_errors::ImageError;

/// Bounds-checked little-endian reader over a borrowed record.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ImageError> {
        let end = self.pos.checked_add(len).ok_or(ImageError::Truncated {
            expected: usize::MAX,
            actual: self.buf.len(),
        })?;
        let out = self.buf.get(self.pos..end).ok_or(ImageError::Truncated {
            expected: end,
            actual: self.buf.len(),
        })?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ImageError> {
        self.bytes(len).map(|_| ())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], ImageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(u8::from_le_bytes(self.array()?))
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ImageError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// NUL-padded string field of exactly `len` bytes.
    pub(crate) fn fixed_str(&mut self, len: usize) -> Result<String, ImageError> {
        let raw = self.bytes(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = raw.get(..end).unwrap_or_default();
        Ok(String::from_utf8_lossy(text).into_owned())
    }
}

/// Little-endian record builder.
#[derive(Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub(crate) fn zeros(&mut self, len: usize) -> &mut Self {
        self.buf.resize(self.buf.len().saturating_add(len), 0);
        self
    }

    pub(crate) fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    pub(crate) fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub(crate) fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Write `s` truncated or NUL-padded to exactly `len` bytes.
    pub(crate) fn fixed_str(&mut self, s: &str, len: usize) -> &mut Self {
        let raw = s.as_bytes();
        let take = raw.len().min(len);
        self.bytes(raw.get(..take).unwrap_or_default());
        self.zeros(len.saturating_sub(take))
    }

    /// Pad with zeros up to absolute length `len`.
    pub(crate) fn pad_to(&mut self, len: usize) -> &mut Self {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
        self
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// CRC32 (IEEE) of `data`, matching the on-flash checksums.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
