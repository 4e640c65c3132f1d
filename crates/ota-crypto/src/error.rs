//! Error types for cryptographic operations

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Signature does not match the digest
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signing failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Key format error
    #[error("Key format error: {0}")]
    KeyFormatError(String),

    /// I/O error
    #[error("File I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid signature length
    #[error("Invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidSignatureLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
