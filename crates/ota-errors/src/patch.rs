//! Delta patch application errors.

use crate::common::ErrorClass;

/// Errors raised while applying a delta patch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// Patch stream rejected by the decoder
    #[error("Patch failed: {0}")]
    Failed(String),

    /// Output produced a different size than declared
    #[error("Patch produced {actual} bytes, header declares {expected}")]
    SizeMismatch {
        /// Size from the patch prefix
        expected: u64,
        /// Bytes produced
        actual: u64,
    },

    /// Output writes must advance strictly sequentially
    #[error("Non-sequential patch write: expected position {expected}, got {actual}")]
    NonSequential {
        /// Next expected position
        expected: u64,
        /// Requested position
        actual: u64,
    },

    /// Patches always start from an erased destination
    #[error("Patch destination at {offset:#010x} is not erased")]
    TargetNotClean {
        /// Destination offset
        offset: u32,
    },

    /// Patch output cannot resume mid-file
    #[error("Patch cannot resume from offset {offset:#x}")]
    ResumeUnsupported {
        /// Journaled offset
        offset: u32,
    },

    /// Source mapping overlaps the destination
    #[error("Patch source {source_offset:#010x} overlaps destination {target_offset:#010x}")]
    SourceAliasesTarget {
        /// Source mapping offset
        source_offset: u32,
        /// Destination offset
        target_offset: u32,
    },
}

impl PatchError {
    /// Recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            PatchError::Failed(_) | PatchError::SizeMismatch { .. } => ErrorClass::Format,
            _ => ErrorClass::Precondition,
        }
    }

    /// Create a decoder failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        PatchError::Failed(msg.into())
    }
}
