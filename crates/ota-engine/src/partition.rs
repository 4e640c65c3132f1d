//! Partition table model
//!
//! The board's partition table is owned by the platform; the engine only
//! reads it through [`PartitionTable`]. A dual-bank layout carries each
//! upgradable file twice, tagged with mirror id 0 and 1; the running bank is
//! [`PartitionTable::current_mirror`] and the other one is the write target.

use std::path::Path;

use ota_errors::ConfigError;
use serde::{Deserialize, Serialize};

/// Well-known file ids.
pub mod file_id {
    /// Boot loader
    pub const BOOT: u8 = 1;
    /// System parameter block holding the firmware version record
    pub const SYS_PARAM: u8 = 2;
    /// Recovery firmware
    pub const RECOVERY: u8 = 3;
    /// Main application firmware
    pub const SYSTEM: u8 = 4;
    /// Resource filesystem
    pub const SDFS: u8 = 5;
    /// Event buffer, never touched by an upgrade
    pub const EVTBUF: u8 = 6;
    /// Crash dump area, never touched by an upgrade
    pub const COREDUMP: u8 = 7;
    /// Staging area for a whole image in recovery mode
    pub const OTA_TEMP: u8 = 9;
}

/// Size of a CRC-framed physical record.
pub const CRC_RECORD_SIZE: u32 = 34;

/// Payload bytes per CRC-framed physical record.
pub const CRC_PAYLOAD_SIZE: u32 = 32;

/// Partition content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    /// Unused or reserved area
    #[default]
    Reserved,
    /// Boot loader
    Boot,
    /// Parameter block
    SysParam,
    /// Executable firmware
    System,
    /// Data or resources
    Data,
    /// Staging area
    Temp,
}

impl PartitionType {
    /// Manifest type keywords, in table order.
    pub const KEYWORDS: [(&'static str, PartitionType); 6] = [
        ("RESERVED", PartitionType::Reserved),
        ("BOOT", PartitionType::Boot),
        ("SYS_PARAM", PartitionType::SysParam),
        ("SYSTEM", PartitionType::System),
        ("DATA", PartitionType::Data),
        ("TEMP", PartitionType::Temp),
    ];

    /// Match a manifest type string by keyword prefix.
    pub fn from_keyword(value: &str) -> Option<Self> {
        Self::KEYWORDS
            .iter()
            .find(|(keyword, _)| value.starts_with(keyword))
            .map(|&(_, ty)| ty)
    }

    /// Manifest keyword for this type.
    pub fn keyword(self) -> &'static str {
        Self::KEYWORDS
            .iter()
            .find(|&&(_, ty)| ty == self)
            .map_or("RESERVED", |&(kw, _)| kw)
    }

    /// Numeric code stored in the breakpoint cursor.
    pub fn code(self) -> u8 {
        match self {
            PartitionType::Reserved => 0,
            PartitionType::Boot => 1,
            PartitionType::SysParam => 2,
            PartitionType::System => 3,
            PartitionType::Data => 4,
            PartitionType::Temp => 5,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes map to `Reserved`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PartitionType::Boot,
            2 => PartitionType::SysParam,
            3 => PartitionType::System,
            4 => PartitionType::Data,
            5 => PartitionType::Temp,
            _ => PartitionType::Reserved,
        }
    }
}

impl std::fmt::Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Partition attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionFlags {
    /// Contents are stored as 34-byte records: 32 payload bytes and a CRC16
    pub crc: bool,
    /// Writes go through the inline encryption engine
    pub encrypted: bool,
}

/// One entry of the board partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Partition name
    pub name: String,
    /// Content type
    #[serde(rename = "type")]
    pub part_type: PartitionType,
    /// File id stored in this partition, 0 for none
    pub file_id: u8,
    /// Bank this entry belongs to, `None` for single-copy partitions
    #[serde(default)]
    pub mirror_id: Option<u8>,
    /// Storage device id
    #[serde(default)]
    pub storage_id: u8,
    /// Partition start address
    pub offset: u32,
    /// Partition size in bytes
    pub size: u32,
    /// Address the file contents start at
    pub file_offset: u32,
    /// Attribute flags
    #[serde(default)]
    pub flags: PartitionFlags,
}

impl PartitionEntry {
    /// Bytes available from the file start to the partition end.
    pub fn file_capacity(&self) -> u32 {
        let lead = self.file_offset.saturating_sub(self.offset);
        self.size.saturating_sub(lead)
    }

    /// Largest logical file the partition holds once CRC framing is accounted for.
    pub fn max_file_size(&self) -> u32 {
        let capacity = self.file_capacity();
        if self.flags.crc {
            capacity / CRC_RECORD_SIZE * CRC_PAYLOAD_SIZE
        } else {
            capacity
        }
    }

    /// Partition end address, saturating.
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.size)
    }

    /// Whether this is the boot loader partition.
    pub fn is_boot(&self) -> bool {
        self.part_type == PartitionType::Boot
    }

    /// Whether this is the parameter partition.
    pub fn is_param(&self) -> bool {
        self.part_type == PartitionType::SysParam
    }

    /// Whether an upgrade must never erase this partition.
    pub fn is_preserved(&self) -> bool {
        matches!(self.file_id, file_id::EVTBUF | file_id::COREDUMP)
    }
}

/// Read-only view of the board partition table.
pub trait PartitionTable: Send + Sync {
    /// All entries in table order.
    fn entries(&self) -> &[PartitionEntry];

    /// Bank the device is running from.
    fn current_mirror(&self) -> u8;

    /// File id of the running firmware.
    fn current_file_id(&self) -> u8;

    /// Bank the upgrade writes to.
    fn inactive_mirror(&self) -> u8 {
        1u8.saturating_sub(self.current_mirror())
    }

    /// Entry by table index.
    fn get(&self, index: usize) -> Option<&PartitionEntry> {
        self.entries().get(index)
    }

    /// Live entry for `file_id`: the single copy, or the running bank's copy.
    fn find(&self, file_id: u8) -> Option<&PartitionEntry> {
        let current = self.current_mirror();
        self.entries()
            .iter()
            .find(|p| p.file_id == file_id && p.mirror_id.is_none_or(|m| m == current))
    }

    /// Inactive-bank entry for `file_id`.
    fn mirror_part(&self, file_id: u8) -> Option<&PartitionEntry> {
        let inactive = Some(self.inactive_mirror());
        self.entries()
            .iter()
            .find(|p| p.file_id == file_id && p.mirror_id == inactive)
    }

    /// Entry the boot loader will pick up `file_id` from after a staged
    /// commit. Only boot and parameter files have one.
    fn boot_mirror_part(&self, file_id: u8) -> Option<&PartitionEntry> {
        let part = self.mirror_part(file_id).or_else(|| {
            self.entries()
                .iter()
                .find(|p| p.file_id == file_id && p.mirror_id.is_none())
        })?;
        (part.is_boot() || part.is_param()).then_some(part)
    }

    /// Whether `part` belongs to the inactive bank.
    fn is_mirror_part(&self, part: &PartitionEntry) -> bool {
        part.mirror_id == Some(self.inactive_mirror())
    }

    /// Staging partition for recovery installs.
    fn temp_part(&self) -> Option<&PartitionEntry> {
        self.entries()
            .iter()
            .find(|p| p.file_id == file_id::OTA_TEMP)
            .or_else(|| {
                self.entries()
                    .iter()
                    .find(|p| p.part_type == PartitionType::Temp)
            })
    }
}

/// Partition table held in memory, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPartitionTable {
    /// Running bank
    #[serde(default)]
    pub current_mirror: u8,
    /// Running firmware file id
    #[serde(default = "default_current_file_id")]
    pub current_file_id: u8,
    /// Entries in table order
    pub partitions: Vec<PartitionEntry>,
}

fn default_current_file_id() -> u8 {
    file_id::SYSTEM
}

impl StaticPartitionTable {
    /// Table running from bank `current_mirror`.
    pub fn new(current_mirror: u8, partitions: Vec<PartitionEntry>) -> Self {
        Self {
            current_mirror,
            current_file_id: file_id::SYSTEM,
            partitions,
        }
    }

    /// Override the running firmware file id.
    #[must_use]
    pub fn with_current_file_id(mut self, file_id: u8) -> Self {
        self.current_file_id = file_id;
        self
    }

    /// Parse a JSON table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or
    /// [`ConfigError::Invalid`] for overlapping or empty entries.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let table: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        table.validate()?;
        Ok(table)
    }

    /// Load a JSON table from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Reject zero-sized entries, file offsets outside their partition and
    /// overlapping partitions on the same storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.current_mirror > 1 {
            return Err(ConfigError::invalid("current_mirror", "must be 0 or 1"));
        }
        for (i, part) in self.partitions.iter().enumerate() {
            if part.size == 0 {
                return Err(ConfigError::invalid(&part.name, "zero-sized partition"));
            }
            if part.file_offset < part.offset || part.file_offset >= part.end() {
                return Err(ConfigError::invalid(
                    &part.name,
                    "file offset outside the partition",
                ));
            }
            let overlap = self.partitions.iter().skip(i.saturating_add(1)).find(|other| {
                other.storage_id == part.storage_id
                    && other.offset < part.end()
                    && part.offset < other.end()
            });
            if let Some(other) = overlap {
                return Err(ConfigError::invalid(
                    &part.name,
                    format!("overlaps partition '{}'", other.name),
                ));
            }
        }
        Ok(())
    }
}

impl PartitionTable for StaticPartitionTable {
    fn entries(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    fn current_mirror(&self) -> u8 {
        self.current_mirror
    }

    fn current_file_id(&self) -> u8 {
        self.current_file_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ty: PartitionType, id: u8, mirror: Option<u8>, offset: u32) -> PartitionEntry {
        PartitionEntry {
            name: name.to_string(),
            part_type: ty,
            file_id: id,
            mirror_id: mirror,
            storage_id: 0,
            offset,
            size: 0x1_0000,
            file_offset: offset,
            flags: PartitionFlags::default(),
        }
    }

    fn table() -> StaticPartitionTable {
        StaticPartitionTable::new(
            0,
            vec![
                entry("boot_a", PartitionType::Boot, file_id::BOOT, Some(0), 0x0),
                entry("boot_b", PartitionType::Boot, file_id::BOOT, Some(1), 0x1_0000),
                entry("system_a", PartitionType::System, file_id::SYSTEM, Some(0), 0x2_0000),
                entry("system_b", PartitionType::System, file_id::SYSTEM, Some(1), 0x3_0000),
                entry("param", PartitionType::SysParam, file_id::SYS_PARAM, None, 0x4_0000),
                entry("temp", PartitionType::Temp, file_id::OTA_TEMP, None, 0x5_0000),
            ],
        )
    }

    #[test]
    fn test_mirror_lookup() {
        let table = table();
        assert_eq!(table.mirror_part(file_id::SYSTEM).map(|p| p.name.as_str()), Some("system_b"));
        assert_eq!(table.find(file_id::SYSTEM).map(|p| p.name.as_str()), Some("system_a"));
        assert!(table.mirror_part(file_id::SYS_PARAM).is_none());
        assert_eq!(table.find(file_id::SYS_PARAM).map(|p| p.name.as_str()), Some("param"));
    }

    #[test]
    fn test_boot_mirror_only_for_boot_and_param() {
        let table = table();
        assert_eq!(table.boot_mirror_part(file_id::BOOT).map(|p| p.name.as_str()), Some("boot_b"));
        assert_eq!(table.boot_mirror_part(file_id::SYS_PARAM).map(|p| p.name.as_str()), Some("param"));
        assert!(table.boot_mirror_part(file_id::SYSTEM).is_none());
    }

    #[test]
    fn test_temp_part() {
        assert_eq!(table().temp_part().map(|p| p.offset), Some(0x5_0000));
    }

    #[test]
    fn test_crc_framed_capacity() {
        let mut part = entry("system", PartitionType::System, file_id::SYSTEM, None, 0);
        part.size = 34 * 100 + 10;
        part.flags.crc = true;
        assert_eq!(part.max_file_size(), 32 * 100);
        part.flags.crc = false;
        assert_eq!(part.max_file_size(), 34 * 100 + 10);
    }

    #[test]
    fn test_type_keywords() {
        assert_eq!(PartitionType::from_keyword("SYSTEM"), Some(PartitionType::System));
        assert_eq!(PartitionType::from_keyword("SYS_PARAM"), Some(PartitionType::SysParam));
        assert_eq!(PartitionType::from_keyword("BOOT_EXTRA"), Some(PartitionType::Boot));
        assert_eq!(PartitionType::from_keyword("FIRMWARE"), None);
        assert_eq!(PartitionType::Temp.to_string(), "TEMP");
        assert_eq!(PartitionType::from_code(PartitionType::Data.code()), PartitionType::Data);
    }

    #[test]
    fn test_json_round_trip_and_overlap() -> Result<(), ConfigError> {
        let json = serde_json::to_string(&table()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let parsed = StaticPartitionTable::from_json_str(&json)?;
        assert_eq!(parsed, table());

        let mut bad = table();
        if let Some(last) = bad.partitions.last_mut() {
            last.offset = 0x4_8000;
            last.file_offset = 0x4_8000;
        }
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid { .. })));
        Ok(())
    }
}
