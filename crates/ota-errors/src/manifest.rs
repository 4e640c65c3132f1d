//! Manifest errors.

use crate::common::ErrorClass;

/// Errors raised while parsing or cross-checking the manifest sub-file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// Manifest exceeds the parse buffer
    #[error("Manifest is {size} bytes, limit is {max}")]
    TooLarge {
        /// Manifest length
        size: usize,
        /// Parse buffer size
        max: usize,
    },

    /// Manifest does not start with an XML prolog
    #[error("Manifest is not an XML document")]
    NotXml,

    /// Required tag missing
    #[error("Missing tag <{0}>")]
    MissingTag(String),

    /// Tag name longer than supported
    #[error("Tag name too long: {0}")]
    TagTooLong(String),

    /// Tag opened but never closed
    #[error("Unterminated tag <{0}>")]
    Unterminated(String),

    /// Integer field could not be parsed
    #[error("Invalid number in <{tag}>: '{value}'")]
    InvalidNumber {
        /// Tag name
        tag: String,
        /// Raw value
        value: String,
    },

    /// Partition type not in the known table
    #[error("Unknown partition type '{0}'")]
    UnknownPartitionType(String),

    /// File name longer than a directory entry holds
    #[error("File name too long: '{0}'")]
    NameTooLong(String),

    /// More partitions than supported
    #[error("Manifest lists {count} partitions, at most {max} supported")]
    TooManyFiles {
        /// Declared count
        count: u32,
        /// Capacity
        max: usize,
    },

    /// Manifest bytes do not match the directory checksum
    #[error("Manifest checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Directory checksum
        expected: u32,
        /// Computed checksum
        actual: u32,
    },

    /// Declared size differs from the directory entry
    #[error("File '{name}' declares {declared} bytes, image directory holds {actual}")]
    SizeMismatch {
        /// File name
        name: String,
        /// Size from the manifest
        declared: u32,
        /// Length from the directory
        actual: u32,
    },
}

impl ManifestError {
    /// Recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            ManifestError::ChecksumMismatch { .. } => ErrorClass::Integrity,
            _ => ErrorClass::Format,
        }
    }
}
