//! Resumable, failure-tolerant firmware update engine
//!
//! Firmware images arrive over a transport (card, serial link, USB, radio or
//! a partition already on the device) and are written into flash partitions
//! the running firmware does not execute from. Every step is journaled, so a
//! power cut or a dropped link costs at most the data since the last journal
//! save, and a device never boots a half-written image.
//!
//! # Architecture
//!
//! - [`flash`]: Raw flash device, watchdog and scheduler-lock seams
//! - [`storage`]: Burst writes, sector-skipping erase and read-back digests
//! - [`partition`]: Partition table model and mirror resolution
//! - [`platform`]: Running version and flash mappings
//! - [`version`]: Version blocks and the parameter version record
//! - [`backend`]: Transports an image is read from
//! - [`image`]: Image head, directory and cancellable reads
//! - [`manifest`]: The `ota.xml` file list
//! - [`breakpoint`]: The persistent breakpoint journal
//! - [`patch`]: Delta patches and granule-framed output
//! - [`upgrade`]: The orchestrator that ties it all together
//! - [`event`]: State, progress and verdict notifications
//! - [`service`]: Async front end with broadcast events
//! - [`package`]: Host-side image packaging
//! - [`sim`]: Simulated flash, stores and platform
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ota_engine::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let flash = SimFlash::new(0x40_0000);
//! let platform = Arc::new(SimPlatform::new(
//!     FirmwareVersion::new(0x0100, "1.0", "board"),
//!     flash.clone(),
//! ));
//! let table = Arc::new(StaticPartitionTable::load(std::path::Path::new("partitions.json"))?);
//!
//! let mut engine = OtaUpgrade::new(
//!     OtaConfig::default(),
//!     UpgradeContext {
//!         storage: OtaStorage::new(Box::new(flash)),
//!         table,
//!         platform,
//!         store: Box::new(MemoryNvStore::new()),
//!         sink: Arc::new(NullSink),
//!     },
//! )?;
//! engine.attach_backend(Box::new(FileBackend::new("update.bin")))?;
//! engine.check()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod wire;

pub mod backend;
pub mod breakpoint;
pub mod config;
pub mod event;
pub mod flash;
pub mod image;
pub mod manifest;
pub mod package;
pub mod partition;
pub mod patch;
pub(crate) mod pipeline;
pub mod platform;
pub mod prelude;
pub mod service;
pub mod sim;
pub mod storage;
pub mod upgrade;
pub mod version;

pub use ota_errors::{ErrorClass, OtaError};

pub use backend::{BackendType, FileBackend, MemoryBackend, TempPartitionBackend, TransportBackend};
pub use breakpoint::{Breakpoint, BreakpointJournal, BreakpointState, FileState, NvStore};
pub use config::{InstallMode, OtaConfig};
pub use event::{EventSink, NullSink, OtaEvent, OtaState};
pub use image::{ImageHeader, OtaImage};
pub use manifest::{Manifest, ManifestFile};
pub use package::ImagePackager;
pub use partition::{PartitionEntry, PartitionTable, PartitionType, StaticPartitionTable};
pub use platform::Platform;
pub use service::OtaService;
pub use storage::OtaStorage;
pub use upgrade::{OtaUpgrade, UpgradeContext, UpgradeDecision, UpgradeStatus};
pub use version::FirmwareVersion;
