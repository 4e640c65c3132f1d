//! Error types for otactl

use ota_errors::{ConfigError, ManifestError, OtaError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Image signature does not verify")]
    BadSignature,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Upgrade failed: {0}")]
    Upgrade(#[from] OtaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Key error: {0}")]
    Crypto(#[from] ota_crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
