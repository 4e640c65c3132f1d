//! Image container and transport errors.

use crate::common::{ErrorClass, ErrorSeverity};

/// Errors raised while opening or reading a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// Operation requires an open image
    #[error("Image is not open")]
    NotOpen,

    /// Header magic does not match
    #[error("Bad image magic {found:#010x}")]
    BadMagic {
        /// Magic read from the header
        found: u32,
    },

    /// Header size field is not the fixed header size
    #[error("Bad image header size {found:#x}")]
    BadHeaderSize {
        /// Size read from the header
        found: u16,
    },

    /// Image exceeds the supported size
    #[error("Image size {size:#x} exceeds maximum {max:#x}")]
    TooLarge {
        /// Declared size
        size: u32,
        /// Maximum supported size
        max: u32,
    },

    /// Directory declares more files than fit
    #[error("Image declares {count} files, at most {max} supported")]
    TooManyFiles {
        /// Declared file count
        count: u16,
        /// Directory capacity
        max: usize,
    },

    /// Header checksum mismatch
    #[error("Header checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HeaderChecksum {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the header
        actual: u32,
    },

    /// Payload checksum mismatch
    #[error("Data checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    DataChecksum {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// No directory entry with this name
    #[error("File '{0}' not found in image directory")]
    FileNotFound(String),

    /// Read past the end of the image
    #[error("Read of {len} bytes at {offset:#x} exceeds image size {size:#x}")]
    OutOfBounds {
        /// Image offset
        offset: u32,
        /// Request length
        len: usize,
        /// Image size
        size: u32,
    },

    /// Record shorter than its fixed layout
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Required length
        expected: usize,
        /// Available length
        actual: usize,
    },

    /// Transport backend failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport did not deliver in time
    #[error("Transport timed out reading offset {offset:#x}")]
    Timeout {
        /// Image offset of the stalled read
        offset: u32,
    },

    /// Reads were cancelled
    #[error("Image read cancelled")]
    Cancelled,

    /// More bytes were reported than the attempt accounted for
    #[error("Progress overflow: {reported} of {total} bytes")]
    ProgressOverflow {
        /// Bytes reported so far
        reported: u64,
        /// Total bytes of the attempt
        total: u64,
    },
}

impl ImageError {
    /// Recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            ImageError::Transport(_) | ImageError::Timeout { .. } => ErrorClass::Transport,
            ImageError::Cancelled => ErrorClass::Cancelled,
            ImageError::HeaderChecksum { .. } | ImageError::DataChecksum { .. } => {
                ErrorClass::Integrity
            }
            ImageError::NotOpen | ImageError::ProgressOverflow { .. } => ErrorClass::Precondition,
            ImageError::BadMagic { .. }
            | ImageError::BadHeaderSize { .. }
            | ImageError::TooLarge { .. }
            | ImageError::TooManyFiles { .. }
            | ImageError::FileNotFound(_)
            | ImageError::OutOfBounds { .. }
            | ImageError::Truncated { .. } => ErrorClass::Format,
        }
    }

    /// Severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ImageError::Timeout { .. } | ImageError::Cancelled => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        ImageError::Transport(msg.into())
    }
}
