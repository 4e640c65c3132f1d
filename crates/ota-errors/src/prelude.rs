//! Prelude module for convenient error handling imports.

pub use crate::{
    Result,
    common::{ErrorClass, ErrorSeverity, OtaError},
    config::ConfigError,
    image::ImageError,
    journal::JournalError,
    manifest::ManifestError,
    patch::PatchError,
    storage::StorageError,
};
