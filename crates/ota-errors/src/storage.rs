//! Flash device and storage engine errors.

use crate::common::{ErrorClass, ErrorSeverity};

/// Errors raised by the storage engine and the flash devices beneath it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Read failed
    #[error("Flash read of {len} bytes at {offset:#010x} failed: {reason}")]
    Read {
        /// Device offset
        offset: u32,
        /// Request length
        len: usize,
        /// Driver message
        reason: String,
    },

    /// Program failed
    #[error("Flash write of {len} bytes at {offset:#010x} failed: {reason}")]
    Write {
        /// Device offset
        offset: u32,
        /// Request length
        len: usize,
        /// Driver message
        reason: String,
    },

    /// Erase failed
    #[error("Flash erase of {len:#x} bytes at {offset:#010x} failed: {reason}")]
    Erase {
        /// Device offset
        offset: u32,
        /// Erase length
        len: u32,
        /// Driver message
        reason: String,
    },

    /// Offset or length not aligned to the erase unit
    #[error("Range {offset:#010x}+{len:#x} is not aligned to {align:#x}")]
    Misaligned {
        /// Device offset
        offset: u32,
        /// Range length
        len: u32,
        /// Required alignment
        align: u32,
    },

    /// Range exceeds the device
    #[error("Range {offset:#010x}+{len:#x} exceeds device capacity {capacity:#x}")]
    OutOfRange {
        /// Device offset
        offset: u32,
        /// Range length
        len: u64,
        /// Device capacity
        capacity: u32,
    },

    /// Device is write protected
    #[error("Flash device is write protected")]
    WriteProtected,
}

impl StorageError {
    /// Recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::Misaligned { .. } | StorageError::OutOfRange { .. } => {
                ErrorClass::Precondition
            }
            _ => ErrorClass::FlashIo,
        }
    }

    /// Severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::WriteProtected => ErrorSeverity::Warning,
            StorageError::Erase { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Create a read error.
    pub fn read(offset: u32, len: usize, reason: impl Into<String>) -> Self {
        StorageError::Read {
            offset,
            len,
            reason: reason.into(),
        }
    }

    /// Create a write error.
    pub fn write(offset: u32, len: usize, reason: impl Into<String>) -> Self {
        StorageError::Write {
            offset,
            len,
            reason: reason.into(),
        }
    }

    /// Create an erase error.
    pub fn erase(offset: u32, len: u32, reason: impl Into<String>) -> Self {
        StorageError::Erase {
            offset,
            len,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Misaligned {
            offset: 0x1234,
            len: 0x1000,
            align: 0x1000,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x00001234"));
        assert!(msg.contains("0x1000"));
    }

    #[test]
    fn test_storage_error_class() {
        assert_eq!(
            StorageError::read(0, 4, "timeout").class(),
            ErrorClass::FlashIo
        );
        assert_eq!(
            StorageError::OutOfRange {
                offset: 0,
                len: 8,
                capacity: 4
            }
            .class(),
            ErrorClass::Precondition
        );
    }
}
