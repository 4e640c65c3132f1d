//! Image manifest
//!
//! Every image carries an `ota.xml` sub-file listing the files to install
//! and the firmware versions involved:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <ota_firmware>
//!   <firmware_version>
//!     <version_code>0x010203</version_code>
//!     <version_name>1.2.3</version_name>
//!     <board_name>board</board_name>
//!   </firmware_version>
//!   <partitions>
//!     <partitionsNum>1</partitionsNum>
//!     <partition>
//!       <type>SYSTEM</type>
//!       <file_id>4</file_id>
//!       <file_name>app.bin</file_name>
//!       <file_size>0x40000</file_size>
//!       <checksum>0x1234abcd</checksum>
//!     </partition>
//!   </partitions>
//! </ota_firmware>
//! ```
//!
//! Patch images add an `<old_firmware_version>` block naming the firmware
//! the patch applies to.
//!
//! The format is scanned by tag, not parsed as XML: the first `<tag>` after
//! the current position opens a value that runs to the next `</tag>`.

use ota_errors::{ManifestError, OtaError};
use serde::Serialize;
use tracing::{debug, info};

use crate::image::OtaImage;
use crate::image::header::FILE_NAME_LEN;
use crate::partition::PartitionType;
use crate::version::FirmwareVersion;

/// Directory name of the manifest.
pub const MANIFEST_FILE_NAME: &str = "ota.xml";

/// Largest accepted manifest.
pub const MAX_MANIFEST_SIZE: usize = 1536 - 1;

/// Most files a manifest may list.
pub const MAX_MANIFEST_FILES: usize = 15;

const MAX_TAG_LEN: usize = 31;
const MAX_VERSION_NAME_LEN: usize = 63;
const MAX_BOARD_NAME_LEN: usize = 31;

/// One file to install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestFile {
    /// Directory name in the image
    pub name: String,
    /// Content type
    pub file_type: PartitionType,
    /// Destination file id
    pub file_id: u8,
    /// Size in bytes as written to flash
    pub size: u32,
    /// CRC32 of the bytes as written to flash
    pub checksum: u32,
    /// Destination address, resolved against the partition table
    pub offset: u32,
}

/// Parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    /// Target firmware
    pub version: FirmwareVersion,
    /// Firmware a patch applies to
    pub old_version: Option<FirmwareVersion>,
    /// Files to install, in manifest order
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    /// Parse manifest text.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] for a missing or malformed tag, an
    /// unknown partition type, an over-long name or more than 15 files.
    pub fn parse(xml: &str) -> Result<Self, ManifestError> {
        let old_version = match parse_version(xml, "old_firmware_version") {
            Ok(v) => {
                info!(version = %v, "patch image");
                Some(v)
            }
            Err(ManifestError::MissingTag(tag)) if tag == "old_firmware_version" => None,
            Err(e) => return Err(e),
        };
        let version = parse_version(xml, "firmware_version")?;
        let files = parse_partitions(xml)?;
        Ok(Self {
            version,
            old_version,
            files,
        })
    }

    /// Read, check and parse the manifest of an open image.
    ///
    /// # Errors
    ///
    /// Returns an image error if the manifest cannot be read, or a
    /// [`ManifestError`] if it is oversized, fails its directory checksum,
    /// does not parse, or (for full images) lists a size that differs from
    /// the directory.
    pub fn load(image: &mut OtaImage) -> Result<Self, OtaError> {
        let len = image.file_length(Some(MANIFEST_FILE_NAME))? as usize;
        if len > MAX_MANIFEST_SIZE {
            return Err(ManifestError::TooLarge {
                size: len,
                max: MAX_MANIFEST_SIZE,
            }
            .into());
        }
        let offset = image.file_offset(Some(MANIFEST_FILE_NAME))?;
        let mut data = vec![0u8; len];
        image.read(offset, &mut data)?;

        if !data.starts_with(b"<?xml") {
            return Err(ManifestError::NotXml.into());
        }
        let (expected, actual) = image.file_checksums(MANIFEST_FILE_NAME, &data)?;
        if expected != actual {
            return Err(ManifestError::ChecksumMismatch { expected, actual }.into());
        }

        let text = String::from_utf8_lossy(&data);
        let manifest = Self::parse(&text)?;

        if !manifest.is_patch() {
            for file in &manifest.files {
                let actual = image.file_length(Some(&file.name))?;
                if actual != file.size {
                    return Err(ManifestError::SizeMismatch {
                        name: file.name.clone(),
                        declared: file.size,
                        actual,
                    }
                    .into());
                }
            }
        }
        info!(
            files = manifest.files.len(),
            version = %manifest.version,
            "manifest loaded"
        );
        Ok(manifest)
    }

    /// Whether this is a patch image.
    pub fn is_patch(&self) -> bool {
        self.old_version.is_some()
    }

    /// File entry for `file_id`.
    pub fn file(&self, file_id: u8) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    /// Render manifest text that [`parse`](Self::parse) accepts.
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ota_firmware>\n");
        if let Some(old) = &self.old_version {
            push_version(&mut xml, "old_firmware_version", old);
        }
        push_version(&mut xml, "firmware_version", &self.version);
        xml.push_str("  <partitions>\n");
        xml.push_str(&format!(
            "    <partitionsNum>{}</partitionsNum>\n",
            self.files.len()
        ));
        for file in &self.files {
            xml.push_str(&format!(
                "    <partition>\n      <type>{}</type>\n      <file_id>{}</file_id>\n      \
                 <file_name>{}</file_name>\n      <file_size>{:#x}</file_size>\n      \
                 <checksum>{:#010x}</checksum>\n    </partition>\n",
                file.file_type.keyword(),
                file.file_id,
                file.name,
                file.size,
                file.checksum
            ));
        }
        xml.push_str("  </partitions>\n</ota_firmware>\n");
        xml
    }
}

fn push_version(xml: &mut String, tag: &str, v: &FirmwareVersion) {
    xml.push_str(&format!(
        "  <{tag}>\n    <version_code>{:#x}</version_code>\n    \
         <version_name>{}</version_name>\n    <board_name>{}</board_name>\n  </{tag}>\n",
        v.version_code, v.version_name, v.board_name
    ));
}

/// Locate the value of `tag` in `text`, returning it and the remainder of
/// `text` starting at the closing tag.
fn tag_value<'a>(text: &'a str, tag: &str) -> Result<(&'a str, &'a str), ManifestError> {
    if tag.len() > MAX_TAG_LEN {
        return Err(ManifestError::TagTooLong(tag.to_string()));
    }
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text
        .find(&open)
        .map(|i| i.saturating_add(open.len()))
        .ok_or_else(|| ManifestError::MissingTag(tag.to_string()))?;
    let body = text.get(start..).unwrap_or_default();
    let end = body
        .find(&close)
        .ok_or_else(|| ManifestError::Unterminated(tag.to_string()))?;
    let value = body.get(..end).unwrap_or_default();
    let rest = body.get(end..).unwrap_or_default();
    Ok((value, rest))
}

fn tag_u32(text: &str, tag: &str) -> Result<u32, ManifestError> {
    let (value, _) = tag_value(text, tag)?;
    parse_c_ulong(value).ok_or_else(|| ManifestError::InvalidNumber {
        tag: tag.to_string(),
        value: value.to_string(),
    })
}

fn tag_str(text: &str, tag: &str, max_len: usize) -> Result<String, ManifestError> {
    let (value, _) = tag_value(text, tag)?;
    if value.len() > max_len {
        return Err(ManifestError::NameTooLong(value.to_string()));
    }
    Ok(value.to_string())
}

fn parse_version(xml: &str, tag: &str) -> Result<FirmwareVersion, ManifestError> {
    let (section, _) = tag_value(xml, tag)?;
    Ok(FirmwareVersion {
        version_code: tag_u32(section, "version_code")?,
        version_name: tag_str(section, "version_name", MAX_VERSION_NAME_LEN)?,
        board_name: tag_str(section, "board_name", MAX_BOARD_NAME_LEN)?,
    })
}

fn parse_partitions(xml: &str) -> Result<Vec<ManifestFile>, ManifestError> {
    let count = tag_u32(xml, "partitionsNum")?;
    debug!(count, "manifest partitions");
    if count as usize > MAX_MANIFEST_FILES {
        return Err(ManifestError::TooManyFiles {
            count,
            max: MAX_MANIFEST_FILES,
        });
    }

    let (mut rest, _) = tag_value(xml, "partitions")?;
    let mut files = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (part, after) = tag_value(rest, "partition")?;
        rest = after;

        let (type_str, _) = tag_value(part, "type")?;
        let file_type = PartitionType::from_keyword(type_str)
            .ok_or_else(|| ManifestError::UnknownPartitionType(type_str.to_string()))?;
        let raw_id = tag_u32(part, "file_id")?;
        let file_id = u8::try_from(raw_id).map_err(|_| ManifestError::InvalidNumber {
            tag: "file_id".to_string(),
            value: raw_id.to_string(),
        })?;
        let name = tag_str(part, "file_name", FILE_NAME_LEN)?;
        let size = tag_u32(part, "file_size")?;
        let checksum = tag_u32(part, "checksum")?;
        debug!(%name, %file_type, file_id, size, checksum, "manifest file");
        files.push(ManifestFile {
            name,
            file_type,
            file_id,
            size,
            checksum,
            offset: 0,
        });
    }
    Ok(files)
}

/// Parse an unsigned integer the way C `strtoul(s, _, 0)` picks its base:
/// `0x`/`0X` prefix for hex, a leading `0` for octal, decimal otherwise.
///
/// Surrounding whitespace and a leading `+` are accepted. Anything else that
/// is not a digit of the chosen base, an empty number, or a value above
/// `u32::MAX` yields `None`.
pub fn parse_c_ulong(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (s.get(1..).unwrap_or_default(), 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            version: FirmwareVersion::new(0x01_0203, "1.2.3", "board"),
            old_version: None,
            files: vec![
                ManifestFile {
                    name: "app.bin".into(),
                    file_type: PartitionType::System,
                    file_id: 4,
                    size: 0x4_0000,
                    checksum: 0x1234_ABCD,
                    offset: 0,
                },
                ManifestFile {
                    name: "param.bin".into(),
                    file_type: PartitionType::SysParam,
                    file_id: 2,
                    size: 0x1000,
                    checksum: 0x55,
                    offset: 0,
                },
            ],
        }
    }

    #[test]
    fn test_parse_rendered_manifest() -> Result<(), ManifestError> {
        let parsed = Manifest::parse(&sample().to_xml())?;
        assert_eq!(parsed, sample());
        assert!(!parsed.is_patch());
        assert_eq!(parsed.file(2).map(|f| f.name.as_str()), Some("param.bin"));
        Ok(())
    }

    #[test]
    fn test_patch_manifest() -> Result<(), ManifestError> {
        let mut m = sample();
        m.old_version = Some(FirmwareVersion::new(0x01_0202, "1.2.2", "board"));
        let parsed = Manifest::parse(&m.to_xml())?;
        assert!(parsed.is_patch());
        assert_eq!(parsed.version.version_code, 0x01_0203);
        assert_eq!(parsed.old_version.map(|v| v.version_code), Some(0x01_0202));
        Ok(())
    }

    #[test]
    fn test_too_many_files() {
        let xml = sample().to_xml().replace(
            "<partitionsNum>2</partitionsNum>",
            "<partitionsNum>16</partitionsNum>",
        );
        assert!(matches!(
            Manifest::parse(&xml),
            Err(ManifestError::TooManyFiles { count: 16, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let xml = sample().to_xml().replace("<type>SYSTEM</type>", "<type>FIRMWARE</type>");
        assert!(matches!(
            Manifest::parse(&xml),
            Err(ManifestError::UnknownPartitionType(_))
        ));
    }

    #[test]
    fn test_missing_partition() {
        let xml = sample().to_xml().replace(
            "<partitionsNum>2</partitionsNum>",
            "<partitionsNum>3</partitionsNum>",
        );
        assert!(matches!(
            Manifest::parse(&xml),
            Err(ManifestError::MissingTag(tag)) if tag == "partition"
        ));
    }

    #[test]
    fn test_long_file_name() {
        let xml = sample()
            .to_xml()
            .replace("<file_name>app.bin</file_name>", "<file_name>application.bin</file_name>");
        assert!(matches!(Manifest::parse(&xml), Err(ManifestError::NameTooLong(_))));
    }

    #[test]
    fn test_parse_c_ulong() {
        assert_eq!(parse_c_ulong("42"), Some(42));
        assert_eq!(parse_c_ulong(" 0x1F "), Some(31));
        assert_eq!(parse_c_ulong("0X1f"), Some(31));
        assert_eq!(parse_c_ulong("010"), Some(8));
        assert_eq!(parse_c_ulong("0"), Some(0));
        assert_eq!(parse_c_ulong("+7"), Some(7));
        assert_eq!(parse_c_ulong("0x"), None);
        assert_eq!(parse_c_ulong("09"), None);
        assert_eq!(parse_c_ulong("-1"), None);
        assert_eq!(parse_c_ulong("12ab"), None);
        assert_eq!(parse_c_ulong("0x100000000"), None);
        assert_eq!(parse_c_ulong(""), None);
    }
}
