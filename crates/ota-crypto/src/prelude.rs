//! Prelude for ota-crypto
//!
//! Re-exports the key types and error aliases.

pub use crate::error::{CryptoError, CryptoResult};
pub use crate::signature::{DIGEST_LEN, ImageSigningKey, ImageVerifyingKey};
pub use crate::utils::{compute_sha256, compute_sha256_hex};
