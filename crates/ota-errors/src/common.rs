//! Top-level error type and classification shared by all OTA crates.
//!
//! The class of an error, not its message, drives every recovery decision:
//! transport-class failures keep the journal resumable while flash, integrity
//! and format failures leave the affected file in an absorbing failure state.

use core::fmt;

use crate::{ConfigError, ImageError, JournalError, ManifestError, PatchError, StorageError};

/// Top-level error that wraps every component error.
#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    /// Storage engine / flash device errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Image container and transport errors
    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    /// Manifest errors
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Breakpoint journal errors
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Patch engine errors
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Signature could not be checked or did not match
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Written bytes do not match the expected checksum
    #[error("Verification of '{file}' failed: expected {expected:#010x}, got {actual:#010x}")]
    VerifyFailed {
        /// File name
        file: String,
        /// Checksum from the manifest
        expected: u32,
        /// Checksum computed over flash
        actual: u32,
    },

    /// No destination partition resolves for a file id
    #[error("No partition for file id {file_id}")]
    UnknownPartition {
        /// Manifest file id
        file_id: u8,
    },

    /// Destination partition sits on another storage device
    #[error("File id {file_id} targets storage {actual}, engine is bound to storage {expected}")]
    StorageMismatch {
        /// Manifest file id
        file_id: u8,
        /// Storage id of the bound device
        expected: u8,
        /// Storage id of the partition
        actual: u8,
    },

    /// File does not fit into its partition
    #[error("File id {file_id} is {size} bytes, partition holds {max}")]
    FileTooLarge {
        /// Manifest file id
        file_id: u8,
        /// Declared file size
        size: u32,
        /// Partition capacity
        max: u32,
    },

    /// Image is not applicable to this device
    #[error("Upgrade declined: {0}")]
    Declined(String),

    /// An event sink requested the attempt to stop
    #[error("Upgrade aborted by event sink")]
    Aborted,

    /// No transport backend is attached
    #[error("No transport backend attached")]
    BackendUnavailable,

    /// A different backend is already attached
    #[error("Backend '{attached}' already attached, cannot attach '{requested}'")]
    BackendBusy {
        /// Type of the attached backend
        attached: String,
        /// Type of the rejected backend
        requested: String,
    },

    /// Host I/O errors
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl OtaError {
    /// Recovery class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            OtaError::Storage(e) => e.class(),
            OtaError::Image(e) => e.class(),
            OtaError::Manifest(e) => e.class(),
            OtaError::Journal(e) => e.class(),
            OtaError::Patch(e) => e.class(),
            OtaError::Config(_) => ErrorClass::Config,
            OtaError::Signature(_) | OtaError::VerifyFailed { .. } => ErrorClass::Integrity,
            OtaError::UnknownPartition { .. }
            | OtaError::StorageMismatch { .. }
            | OtaError::FileTooLarge { .. }
            | OtaError::BackendUnavailable
            | OtaError::BackendBusy { .. } => ErrorClass::Precondition,
            OtaError::Declined(_) => ErrorClass::Declined,
            OtaError::Aborted => ErrorClass::Cancelled,
            OtaError::Io(_) => ErrorClass::Transport,
        }
    }

    /// Severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            OtaError::Storage(e) => e.severity(),
            OtaError::Image(e) => e.severity(),
            OtaError::Manifest(_) => ErrorSeverity::Error,
            OtaError::Journal(e) => e.severity(),
            OtaError::Patch(_) => ErrorSeverity::Error,
            OtaError::Config(_) => ErrorSeverity::Error,
            OtaError::Signature(_) | OtaError::VerifyFailed { .. } => ErrorSeverity::Error,
            OtaError::UnknownPartition { .. }
            | OtaError::StorageMismatch { .. }
            | OtaError::FileTooLarge { .. } => ErrorSeverity::Critical,
            OtaError::Declined(_) => ErrorSeverity::Info,
            OtaError::Aborted => ErrorSeverity::Warning,
            OtaError::BackendUnavailable => ErrorSeverity::Error,
            OtaError::BackendBusy { .. } => ErrorSeverity::Warning,
            OtaError::Io(_) => ErrorSeverity::Warning,
        }
    }

    /// True when the journal must keep the interrupted file resumable instead
    /// of marking it failed.
    pub fn is_resumable(&self) -> bool {
        self.class().is_resumable()
    }

    /// Create a signature error with a message.
    pub fn signature(msg: impl Into<String>) -> Self {
        OtaError::Signature(msg.into())
    }

    /// Create a declined error with a reason.
    pub fn declined(reason: impl Into<String>) -> Self {
        OtaError::Declined(reason.into())
    }
}

impl From<std::io::Error> for OtaError {
    fn from(e: std::io::Error) -> Self {
        OtaError::Io(e)
    }
}

/// Recovery class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorClass {
    /// Transport or backend timeouts and I/O; always retryable
    Transport = 0,
    /// Flash read, write or erase failures
    FlashIo = 1,
    /// Checksum or signature mismatch
    Integrity = 2,
    /// Malformed image, manifest or journal record
    Format = 3,
    /// Logic or precondition violations
    Precondition = 4,
    /// Cooperative cancellation
    Cancelled = 5,
    /// Invalid configuration
    Config = 6,
    /// Image not applicable to this device
    Declined = 7,
}

impl ErrorClass {
    /// Transport failures and cancellations leave the journal resumable.
    pub fn is_resumable(self) -> bool {
        matches!(self, ErrorClass::Transport | ErrorClass::Cancelled)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transport => write!(f, "Transport"),
            ErrorClass::FlashIo => write!(f, "FlashIo"),
            ErrorClass::Integrity => write!(f, "Integrity"),
            ErrorClass::Format => write!(f, "Format"),
            ErrorClass::Precondition => write!(f, "Precondition"),
            ErrorClass::Cancelled => write!(f, "Cancelled"),
            ErrorClass::Config => write!(f, "Config"),
            ErrorClass::Declined => write!(f, "Declined"),
        }
    }
}

/// Error severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ErrorSeverity {
    /// Informational, no action required
    Info = 0,
    /// Warning, may require attention
    Warning = 1,
    /// Error, operation failed
    Error = 2,
    /// Critical, device configuration is inconsistent
    Critical = 3,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARN"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}
