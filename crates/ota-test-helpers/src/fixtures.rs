//! Partition layouts, image builders and simulated boards.

use std::sync::Arc;

use ota_engine::config::OtaConfig;
use ota_engine::event::EventSink;
use ota_engine::package::ImagePackager;
use ota_engine::partition::{PartitionEntry, PartitionFlags, PartitionTable, PartitionType, StaticPartitionTable, file_id};
use ota_engine::sim::{MemoryNvStore, SimFlash, SimPlatform};
use ota_engine::storage::OtaStorage;
use ota_engine::upgrade::{OtaUpgrade, UpgradeContext, UpgradeStatus, read_status};
use ota_engine::version::{FirmwareVersion, FwVersionRecord};
use ota_errors::{JournalError, OtaError};

use crate::mock::{FaultyFlash, FaultyNvStore, PowerCut};

/// PKCS#8 RSA-2048 private key shared by the test suites.
pub const TEST_SIGNING_KEY_PEM: &str = include_str!("../../ota-crypto/tests/fixtures/signing_key.pem");

/// Public half of [`TEST_SIGNING_KEY_PEM`].
pub const TEST_VERIFYING_KEY_PEM: &str = include_str!("../../ota-crypto/tests/fixtures/verifying_key.pem");

/// Board name used by every fixture.
pub const TEST_BOARD: &str = "sim-board";

/// Flash size of a [`SimBoard`].
pub const SIM_FLASH_SIZE: u32 = 0x40_0000;

/// Offset of the version record in fixture parameter files.
pub const PARAM_VERSION_OFFSET: u32 = 0x100;

/// Canned partition layouts.
pub struct TableFixture;

impl TableFixture {
    /// One partition entry.
    pub fn entry(name: &str, ty: PartitionType, id: u8, mirror: Option<u8>, offset: u32, size: u32) -> PartitionEntry {
        PartitionEntry {
            name: name.to_string(),
            part_type: ty,
            file_id: id,
            mirror_id: mirror,
            storage_id: 0,
            offset,
            size,
            file_offset: offset,
            flags: PartitionFlags::default(),
        }
    }

    /// Dual-bank layout running from bank 0.
    ///
    /// ```text
    /// 0x000000 boot_a    0x010000 boot_b
    /// 0x020000 param_a   0x030000 param_b
    /// 0x040000 system_a  0x0C0000 system_b
    /// 0x140000 sdfs_a    0x180000 sdfs_b
    /// 0x1C0000 evtbuf
    /// ```
    pub fn dual_bank() -> StaticPartitionTable {
        use PartitionType::*;
        StaticPartitionTable::new(
            0,
            vec![
                Self::entry("boot_a", Boot, file_id::BOOT, Some(0), 0x00_0000, 0x1_0000),
                Self::entry("boot_b", Boot, file_id::BOOT, Some(1), 0x01_0000, 0x1_0000),
                Self::entry("param_a", SysParam, file_id::SYS_PARAM, Some(0), 0x02_0000, 0x1_0000),
                Self::entry("param_b", SysParam, file_id::SYS_PARAM, Some(1), 0x03_0000, 0x1_0000),
                Self::entry("system_a", System, file_id::SYSTEM, Some(0), 0x04_0000, 0x8_0000),
                Self::entry("system_b", System, file_id::SYSTEM, Some(1), 0x0C_0000, 0x8_0000),
                Self::entry("sdfs_a", Data, file_id::SDFS, Some(0), 0x14_0000, 0x4_0000),
                Self::entry("sdfs_b", Data, file_id::SDFS, Some(1), 0x18_0000, 0x4_0000),
                Self::entry("evtbuf", Data, file_id::EVTBUF, None, 0x1C_0000, 0x1_0000),
            ],
        )
    }

    /// Single-bank layout with a recovery firmware and a temp partition.
    /// The boot loader keeps two banks; everything else has one copy.
    ///
    /// ```text
    /// 0x000000 boot_a    0x010000 boot_b
    /// 0x020000 param
    /// 0x030000 recovery
    /// 0x070000 system
    /// 0x0F0000 sdfs
    /// 0x130000 temp
    /// ```
    pub fn recovery() -> StaticPartitionTable {
        use PartitionType::*;
        StaticPartitionTable::new(
            0,
            vec![
                Self::entry("boot_a", Boot, file_id::BOOT, Some(0), 0x00_0000, 0x1_0000),
                Self::entry("boot_b", Boot, file_id::BOOT, Some(1), 0x01_0000, 0x1_0000),
                Self::entry("param", SysParam, file_id::SYS_PARAM, None, 0x02_0000, 0x1_0000),
                Self::entry("recovery", System, file_id::RECOVERY, None, 0x03_0000, 0x4_0000),
                Self::entry("system", System, file_id::SYSTEM, None, 0x07_0000, 0x8_0000),
                Self::entry("sdfs", Data, file_id::SDFS, None, 0x0F_0000, 0x4_0000),
                Self::entry("temp", Temp, file_id::OTA_TEMP, None, 0x13_0000, 0x10_0000),
            ],
        )
    }
}

/// Image contents.
pub struct ImageFixture;

impl ImageFixture {
    /// `len` deterministic pseudo-random bytes.
    pub fn payload(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed.wrapping_mul(0x9E37_79B9) | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 24) as u8
            })
            .collect()
    }

    /// A parameter file of `len` bytes carrying a sealed version record.
    pub fn param_file(version: &FirmwareVersion, len: usize) -> Vec<u8> {
        let mut record = FwVersionRecord {
            version_code: version.version_code,
            system_version_code: version.version_code,
            version_name: version.version_name.clone(),
            board_name: version.board_name.clone(),
            ..FwVersionRecord::default()
        };
        record.seal();
        let mut file = vec![0u8; len];
        let at = PARAM_VERSION_OFFSET as usize;
        if let Some(slot) = file.get_mut(at..at + record.encode().len()) {
            slot.copy_from_slice(&record.encode());
        }
        file
    }

    /// Version `code` of the fixture board.
    pub fn version(code: u32) -> FirmwareVersion {
        FirmwareVersion::new(code, format!("{}.{}", code >> 8, code & 0xFF), TEST_BOARD)
    }

    /// Packager for a full image: system and resource files.
    pub fn app_image(version: FirmwareVersion, system: Vec<u8>, sdfs: Vec<u8>) -> ImagePackager {
        ImagePackager::new(version)
            .file("system.bin", PartitionType::System, file_id::SYSTEM, system)
            .file("sdfs.bin", PartitionType::Data, file_id::SDFS, sdfs)
    }

    /// Packager for a full image that also carries boot and parameter files.
    pub fn full_image(version: FirmwareVersion, seed: u32) -> ImagePackager {
        let param = Self::param_file(&version, 0x400);
        Self::app_image(version, Self::payload(0x1_8000, seed), Self::payload(0x6000, seed ^ 0x55))
            .file("boot.bin", PartitionType::Boot, file_id::BOOT, Self::payload(0x2000, seed ^ 0xAA))
            .file("param.bin", PartitionType::SysParam, file_id::SYS_PARAM, param)
    }
}

/// A simulated device: flash, journal store, platform and partition table.
///
/// [`engine`](Self::engine) builds an engine over fault-injecting wrappers
/// sharing the board's power cut; [`reboot`](Self::reboot) restores power.
#[derive(Debug, Clone)]
pub struct SimBoard {
    /// Device flash
    pub flash: SimFlash,
    /// Journal store
    pub store: MemoryNvStore,
    /// Running firmware and flash mapping
    pub platform: Arc<SimPlatform>,
    /// Partition table
    pub table: Arc<StaticPartitionTable>,
    /// Trip wire for the next engine
    pub cut: PowerCut,
}

impl SimBoard {
    /// Board with `table`, running `running`.
    pub fn new(table: StaticPartitionTable, running: FirmwareVersion) -> Self {
        let flash = SimFlash::new(SIM_FLASH_SIZE).with_name("sim-nor");
        Self {
            platform: Arc::new(SimPlatform::new(running, flash.clone())),
            flash,
            store: MemoryNvStore::new(),
            table: Arc::new(table),
            cut: PowerCut::new(),
        }
    }

    /// Dual-bank board running version `code`.
    pub fn dual_bank(code: u32) -> Self {
        Self::new(TableFixture::dual_bank(), ImageFixture::version(code))
    }

    /// Recovery board running version `code`.
    pub fn recovery(code: u32) -> Self {
        Self::new(TableFixture::recovery(), ImageFixture::version(code))
    }

    /// Engine configuration matching the fixture layouts.
    pub fn config() -> OtaConfig {
        OtaConfig {
            param_version_offset: PARAM_VERSION_OFFSET,
            ..OtaConfig::default()
        }
    }

    /// Build an engine.
    ///
    /// # Errors
    ///
    /// Whatever [`OtaUpgrade::new`] returns.
    pub fn engine(&self, config: OtaConfig, sink: Arc<dyn EventSink>) -> Result<OtaUpgrade, OtaError> {
        self.engine_over(self.faulty_flash(), config, sink)
    }

    /// The board flash behind the board's power cut, ready for more faults.
    pub fn faulty_flash(&self) -> FaultyFlash {
        FaultyFlash::new(self.flash.clone(), self.cut.clone())
    }

    /// Build an engine writing through `flash`.
    ///
    /// # Errors
    ///
    /// Whatever [`OtaUpgrade::new`] returns.
    pub fn engine_over(
        &self,
        flash: FaultyFlash,
        config: OtaConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<OtaUpgrade, OtaError> {
        OtaUpgrade::new(
            config,
            UpgradeContext {
                storage: OtaStorage::new(Box::new(flash)),
                table: Arc::clone(&self.table) as Arc<dyn PartitionTable>,
                platform: Arc::clone(&self.platform) as _,
                store: Box::new(FaultyNvStore::new(self.store.clone(), self.cut.clone())),
                sink,
            },
        )
    }

    /// Lose power after `bytes` more bytes are programmed.
    pub fn arm_power_cut(&mut self, bytes: u64) {
        self.cut = PowerCut::after_bytes(bytes);
    }

    /// Restore power. Engines built before the reboot stay dead.
    pub fn reboot(&mut self) {
        self.cut = PowerCut::new();
    }

    /// Entry named `name`.
    pub fn part(&self, name: &str) -> Option<PartitionEntry> {
        self.table.entries().iter().find(|p| p.name == name).cloned()
    }

    /// First `len` bytes of partition `name`.
    pub fn read_part(&self, name: &str, len: usize) -> Vec<u8> {
        self.part(name)
            .map(|p| self.flash.slice(p.offset, len))
            .unwrap_or_default()
    }

    /// Whether partition `name` is fully erased.
    pub fn is_erased(&self, name: &str) -> bool {
        self.part(name).is_some_and(|p| {
            self.flash
                .slice(p.offset, p.size as usize)
                .iter()
                .all(|&b| b == ota_engine::flash::ERASED_BYTE)
        })
    }

    /// Stored journal status.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn status(&self) -> Result<Option<UpgradeStatus>, JournalError> {
        read_status(&self.store)
    }
}
