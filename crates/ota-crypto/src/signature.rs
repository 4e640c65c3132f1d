//! RSA PKCS#1 v1.5 signatures over SHA-256 image digests
//!
//! Staged images carry a detached signature of exactly one modulus length
//! appended after the signed region. The device only ever verifies, so
//! [`ImageVerifyingKey`] is the type the engine holds; [`ImageSigningKey`]
//! exists for host-side packaging and tests.
//!
//! # Key formats
//!
//! Public keys load from SubjectPublicKeyInfo PEM (`BEGIN PUBLIC KEY`) or
//! PKCS#1 PEM (`BEGIN RSA PUBLIC KEY`). Private keys load from PKCS#8 or
//! PKCS#1 PEM.

use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::utils;

/// Length of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Public key used to verify staged images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVerifyingKey {
    key: RsaPublicKey,
}

impl ImageVerifyingKey {
    /// Parse a PEM encoded public key.
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let key = match RsaPublicKey::from_public_key_pem(pem) {
            Ok(key) => key,
            Err(spki_err) => RsaPublicKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                CryptoError::KeyFormatError(format!(
                    "not an SPKI ({spki_err}) or PKCS#1 ({pkcs1_err}) public key"
                ))
            })?,
        };
        Ok(Self { key })
    }

    /// Parse a DER encoded SubjectPublicKeyInfo.
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::KeyFormatError(e.to_string()))?;
        Ok(Self { key })
    }

    /// Load a PEM public key from disk.
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    /// Signature length in bytes, equal to the modulus size.
    pub fn signature_len(&self) -> usize {
        self.key.size()
    }

    /// SPKI PEM encoding.
    pub fn to_pem(&self) -> CryptoResult<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyFormatError(e.to_string()))
    }

    /// SHA-256 fingerprint of the DER encoded key, hex encoded.
    pub fn fingerprint(&self) -> CryptoResult<String> {
        let der = self
            .key
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyFormatError(e.to_string()))?;
        Ok(utils::compute_sha256_hex(der.as_bytes()))
    }

    /// Verify `signature` against a precomputed SHA-256 digest.
    pub fn verify_digest(&self, digest: &[u8; DIGEST_LEN], signature: &[u8]) -> CryptoResult<()> {
        let expected = self.signature_len();
        if signature.len() != expected {
            return Err(CryptoError::InvalidSignatureLength {
                expected,
                actual: signature.len(),
            });
        }
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .map_err(|e| {
                warn!(error = %e, "image signature rejected");
                CryptoError::InvalidSignature
            })?;
        debug!("image signature verified");
        Ok(())
    }

    /// Hash `data` and verify `signature` over it.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> CryptoResult<()> {
        self.verify_digest(&utils::compute_sha256(data), signature)
    }
}

/// Private key used by host tooling to sign images.
#[derive(Debug, Clone)]
pub struct ImageSigningKey {
    key: RsaPrivateKey,
}

impl ImageSigningKey {
    /// Parse a PKCS#8 or PKCS#1 PEM private key.
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let key = match RsaPrivateKey::from_pkcs8_pem(pem) {
            Ok(key) => key,
            Err(pkcs8_err) => RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                CryptoError::KeyFormatError(format!(
                    "not a PKCS#8 ({pkcs8_err}) or PKCS#1 ({pkcs1_err}) private key"
                ))
            })?,
        };
        Ok(Self { key })
    }

    /// Load a PEM private key from disk.
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    /// Generate a fresh key of `bits` modulus length.
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeyFormatError(e.to_string()))?;
        Ok(Self { key })
    }

    /// PKCS#8 PEM encoding.
    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyFormatError(e.to_string()))?;
        Ok(pem.as_str().to_owned())
    }

    /// Matching public key.
    pub fn verifying_key(&self) -> ImageVerifyingKey {
        ImageVerifyingKey {
            key: self.key.to_public_key(),
        }
    }

    /// Signature length in bytes.
    pub fn signature_len(&self) -> usize {
        self.key.size()
    }

    /// Sign a precomputed SHA-256 digest.
    pub fn sign_digest(&self, digest: &[u8; DIGEST_LEN]) -> CryptoResult<Vec<u8>> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))
    }

    /// Hash and sign `data`.
    pub fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.sign_digest(&utils::compute_sha256(data))
    }
}
