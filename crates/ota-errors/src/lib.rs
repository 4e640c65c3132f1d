//! Error taxonomy for the OTA update engine
//!
//! Every fallible operation in the engine reports one of the component errors
//! defined here, and the orchestrator folds them into [`OtaError`]. The
//! classification exposed by [`OtaError::class`] is what decides whether an
//! interrupted attempt stays resumable or leaves an absorbing `*_FAIL` state
//! in the journal.
//!
//! # Architecture
//!
//! - [`common`]: Top-level error, classes and severities
//! - [`storage`]: Flash device and storage engine errors
//! - [`image`]: Image container and transport errors
//! - [`manifest`]: Manifest parse and cross-check errors
//! - [`journal`]: Breakpoint journal errors
//! - [`patch`]: Delta patch application errors
//! - [`config`]: Configuration load and validation errors
//!
//! # Example
//!
//! ```
//! use ota_errors::prelude::*;
//!
//! fn read_header() -> Result<()> {
//!     Err(ImageError::Timeout { offset: 0 }.into())
//! }
//!
//! let err = read_header().unwrap_err();
//! assert_eq!(err.class(), ErrorClass::Transport);
//! assert!(err.is_resumable());
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod common;
pub mod config;
pub mod image;
pub mod journal;
pub mod manifest;
pub mod patch;
pub mod prelude;
pub mod storage;

pub use common::{ErrorClass, ErrorSeverity, OtaError};
pub use config::ConfigError;
pub use image::ImageError;
pub use journal::JournalError;
pub use manifest::ManifestError;
pub use patch::PatchError;
pub use storage::StorageError;

/// A specialized `Result` type for OTA operations.
pub type Result<T> = std::result::Result<T, OtaError>;
