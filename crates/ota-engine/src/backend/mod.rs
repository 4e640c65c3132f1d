//! Transport backends
//!
//! A backend is the source an image is read from. The engine addresses it
//! by absolute image offset and never assumes it can seek cheaply; the only
//! guarantee it relies on is that a successful read fills the whole buffer.
//!
//! # Shipped backends
//!
//! - [`MemoryBackend`]: an image held in memory
//! - [`FileBackend`]: an image file on a host filesystem or card
//! - [`TempPartitionBackend`]: an image staged in the temp partition

mod file;
mod memory;
mod temp_partition;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use temp_partition::TempPartitionBackend;

use ota_errors::ImageError;
use serde::{Deserialize, Serialize};

/// Kind of transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// No backend
    #[default]
    Unknown,
    /// Removable card
    Card,
    /// Bluetooth link
    Bluetooth,
    /// Serial link
    Uart,
    /// USB mass storage or vendor class
    Usb,
    /// Image staged in the local temp partition
    TempPart,
    /// In-memory image
    Memory,
}

impl BackendType {
    /// Code stored in the breakpoint record.
    pub fn code(self) -> u8 {
        match self {
            BackendType::Unknown => 0,
            BackendType::Card => 1,
            BackendType::Bluetooth => 2,
            BackendType::Uart => 3,
            BackendType::Usb => 4,
            BackendType::TempPart => 5,
            BackendType::Memory => 6,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => BackendType::Card,
            2 => BackendType::Bluetooth,
            3 => BackendType::Uart,
            4 => BackendType::Usb,
            5 => BackendType::TempPart,
            6 => BackendType::Memory,
            _ => BackendType::Unknown,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendType::Unknown => "unknown",
            BackendType::Card => "card",
            BackendType::Bluetooth => "bluetooth",
            BackendType::Uart => "uart",
            BackendType::Usb => "usb",
            BackendType::TempPart => "temp-part",
            BackendType::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Image transport.
pub trait TransportBackend: Send {
    /// Transport kind.
    fn backend_type(&self) -> BackendType;

    /// Open the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Transport`] if the link cannot be established.
    fn open(&mut self) -> Result<(), ImageError>;

    /// Close the transport. Failures are logged by the caller and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Transport`] if the link did not shut down cleanly.
    fn close(&mut self) -> Result<(), ImageError>;

    /// Fill `buf` from image offset `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Transport`] or [`ImageError::Timeout`] on link
    /// failure, or [`ImageError::OutOfBounds`] past the end of the image.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError>;

    /// Whether reads can be split into [`read_prepare`](Self::read_prepare)
    /// and [`read_complete`](Self::read_complete) so the next request is in
    /// flight while the previous one is written to flash.
    fn supports_prepared_reads(&self) -> bool {
        false
    }

    /// Issue a request for `len` bytes at `offset` without waiting for data.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Transport`] if the request cannot be sent.
    fn read_prepare(&mut self, _offset: u32, _len: usize) -> Result<(), ImageError> {
        Ok(())
    }

    /// Wait for the data requested by the matching
    /// [`read_prepare`](Self::read_prepare).
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        self.read(offset, buf)
    }

    /// Largest single request the transport accepts, if limited.
    fn max_request_size(&self) -> Option<u32> {
        None
    }

    /// Transfer unit; request lengths are rounded down to a multiple of it.
    fn write_unit(&self) -> u32 {
        1
    }

    /// Forward a progress percentage to the remote end.
    fn report_progress(&mut self, _percent: u8) {}

    /// Tell the remote end whether the received image was accepted.
    fn report_image_valid(&mut self, _valid: bool) {}
}

impl<B: TransportBackend + ?Sized> TransportBackend for Box<B> {
    fn backend_type(&self) -> BackendType {
        (**self).backend_type()
    }

    fn open(&mut self) -> Result<(), ImageError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), ImageError> {
        (**self).close()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        (**self).read(offset, buf)
    }

    fn supports_prepared_reads(&self) -> bool {
        (**self).supports_prepared_reads()
    }

    fn read_prepare(&mut self, offset: u32, len: usize) -> Result<(), ImageError> {
        (**self).read_prepare(offset, len)
    }

    fn read_complete(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
        (**self).read_complete(offset, buf)
    }

    fn max_request_size(&self) -> Option<u32> {
        (**self).max_request_size()
    }

    fn write_unit(&self) -> u32 {
        (**self).write_unit()
    }

    fn report_progress(&mut self, percent: u8) {
        (**self).report_progress(percent);
    }

    fn report_image_valid(&mut self, valid: bool) {
        (**self).report_image_valid(valid);
    }
}

/// Copy `buf.len()` bytes at `offset` out of `data`.
pub(crate) fn copy_range(data: &[u8], offset: u32, buf: &mut [u8]) -> Result<(), ImageError> {
    let start = offset as usize;
    let out_of_bounds = || ImageError::OutOfBounds {
        offset,
        len: buf.len(),
        size: u32::try_from(data.len()).unwrap_or(u32::MAX),
    };
    let end = start.checked_add(buf.len()).ok_or_else(out_of_bounds)?;
    let src = data.get(start..end).ok_or_else(out_of_bounds)?;
    buf.copy_from_slice(src);
    Ok(())
}
