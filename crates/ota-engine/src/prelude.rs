//! Prelude for ota-engine
//!
//! Re-exports what a board integration or a test needs to run an upgrade.

pub use ota_errors::{ErrorClass, OtaError};

pub use crate::backend::{BackendType, FileBackend, MemoryBackend, TempPartitionBackend, TransportBackend};
pub use crate::breakpoint::{Breakpoint, BreakpointState, FileState, NvStore};
pub use crate::config::{InstallMode, OtaConfig};
pub use crate::event::{EventSink, NullSink, OtaEvent, OtaState};
pub use crate::flash::{FlashDevice, SECTOR_SIZE};
pub use crate::manifest::{Manifest, ManifestFile};
pub use crate::package::ImagePackager;
pub use crate::partition::{PartitionEntry, PartitionFlags, PartitionTable, PartitionType, StaticPartitionTable, file_id};
pub use crate::platform::Platform;
pub use crate::service::OtaService;
pub use crate::sim::{FileNvStore, MemoryNvStore, SimFlash, SimPlatform};
pub use crate::storage::OtaStorage;
pub use crate::upgrade::{OtaUpgrade, UpgradeContext, UpgradeDecision, UpgradeStatus};
pub use crate::version::FirmwareVersion;
