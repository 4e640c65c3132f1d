//! Image signature verification for the OTA update engine
//!
//! Secure-boot builds stage firmware images that end in an RSA PKCS#1 v1.5
//! signature over the SHA-256 digest of everything before it. This crate
//! provides the key handling and verification primitives the engine uses
//! for that check, plus signing for host-side packaging.
//!
//! # Architecture
//!
//! - [`signature`]: RSA key loading, signing and verification
//! - [`error`]: Error types for cryptographic operations
//! - [`utils`]: Digest helpers
//!
//! # Example
//!
//! ```no_run
//! use ota_crypto::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = ImageSigningKey::generate(2048)?;
//! let verifier = signer.verifying_key();
//!
//! let image = b"staged image bytes";
//! let signature = signer.sign(image)?;
//! verifier.verify(image, &signature)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod prelude;
pub mod signature;

pub use error::{CryptoError, CryptoResult};
pub use signature::{DIGEST_LEN, ImageSigningKey, ImageVerifyingKey};

/// Digest helpers
pub mod utils {
    use sha2::{Digest, Sha256};

    use crate::signature::DIGEST_LEN;

    /// Compute the SHA-256 digest of data
    pub fn compute_sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Compute the SHA-256 digest of data as a hex string
    pub fn compute_sha256_hex(data: &[u8]) -> String {
        hex::encode(compute_sha256(data))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_sha256_known_vector() {
            assert_eq!(
                compute_sha256_hex(b"abc"),
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            );
        }
    }
}
