//! Breakpoint journal errors.

use crate::common::{ErrorClass, ErrorSeverity};

/// Errors raised by the breakpoint journal and its backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    /// Backing store failed
    #[error("Journal store error: {0}")]
    Store(String),

    /// Stored record is damaged
    #[error("Journal record corrupt: {0}")]
    Corrupt(String),

    /// Stored record has the wrong size
    #[error("Journal record is {actual} bytes, expected {expected}")]
    InvalidLength {
        /// Fixed record size
        expected: usize,
        /// Stored size
        actual: usize,
    },

    /// Every file-state slot is taken
    #[error("No free journal slot for file id {file_id}")]
    SlotsFull {
        /// File id that could not be recorded
        file_id: u8,
    },
}

impl JournalError {
    /// Recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            JournalError::Store(_) => ErrorClass::FlashIo,
            JournalError::Corrupt(_) | JournalError::InvalidLength { .. } => ErrorClass::Format,
            JournalError::SlotsFull { .. } => ErrorClass::Precondition,
        }
    }

    /// Severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            JournalError::Corrupt(_) | JournalError::InvalidLength { .. } => {
                ErrorSeverity::Warning
            }
            JournalError::Store(_) | JournalError::SlotsFull { .. } => ErrorSeverity::Critical,
        }
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        JournalError::Store(msg.into())
    }
}
