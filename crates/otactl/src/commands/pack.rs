//! Image packaging
//!
//! A package description names the target version and the files to carry:
//!
//! ```json
//! {
//!   "version": { "version_code": 512, "version_name": "2.0", "board_name": "board" },
//!   "files": [
//!     { "name": "system.bin", "type": "system", "file_id": 4, "path": "build/system.bin" },
//!     { "name": "sdfs.bin", "type": "data", "file_id": 5, "path": "build/sdfs.bin",
//!       "patch_from": "release-1.0/sdfs.bin" }
//!   ],
//!   "old_version": { "version_code": 256, "version_name": "1.0", "board_name": "board" }
//! }
//! ```
//!
//! Relative paths resolve against the description's directory. A file with
//! `patch_from` is shipped as a delta against that file; `old_version` must
//! then name the firmware the device runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ota_crypto::ImageSigningKey;
use ota_engine::package::ImagePackager;
use ota_engine::partition::PartitionType;
use ota_engine::version::FirmwareVersion;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commands::PackArgs;
use crate::error::CliError;
use crate::output;

/// Contents of a package description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub version: FirmwareVersion,
    #[serde(default)]
    pub old_version: Option<FirmwareVersion>,
    pub files: Vec<PackageFileSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageFileSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: PartitionType,
    pub file_id: u8,
    pub path: PathBuf,
    #[serde(default)]
    pub patch_from: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PackSummary<'a> {
    output: &'a Path,
    size: usize,
    files: usize,
    signed: bool,
    patch: bool,
}

/// Execute pack command
pub fn execute(args: &PackArgs, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(&args.spec)
        .with_context(|| format!("reading {}", args.spec.display()))?;
    let spec: PackageSpec = serde_json::from_str(&text).map_err(CliError::from)?;
    let base = args.spec.parent().unwrap_or_else(|| Path::new("."));
    let signer = args
        .sign
        .as_deref()
        .map(ImageSigningKey::load)
        .transpose()
        .map_err(CliError::from)?;

    let signed = signer.is_some();
    let image = build(&spec, base, signer)?;
    std::fs::write(&args.output, &image).with_context(|| format!("writing {}", args.output.display()))?;
    info!(output = %args.output.display(), size = image.len(), "image written");

    let summary = PackSummary {
        output: &args.output,
        size: image.len(),
        files: spec.files.len(),
        signed,
        patch: spec.old_version.is_some(),
    };
    if json {
        output::print_json("pack", &summary);
    } else {
        output::print_success(&format!(
            "Packed {} file(s) for {} into {} ({} bytes{})",
            summary.files,
            spec.version,
            args.output.display(),
            summary.size,
            if signed { ", signed" } else { "" }
        ));
    }
    Ok(())
}

/// Lay out the image `spec` describes, reading payloads relative to `base`.
pub fn build(spec: &PackageSpec, base: &Path, signer: Option<ImageSigningKey>) -> Result<Vec<u8>> {
    let patches = spec.files.iter().any(|f| f.patch_from.is_some());
    if patches && spec.old_version.is_none() {
        return Err(CliError::InvalidConfiguration("patch files need `old_version`".into()).into());
    }

    let mut packager = ImagePackager::new(spec.version.clone());
    if let Some(old) = &spec.old_version {
        packager = packager.with_old_version(old.clone());
    }
    if let Some(signer) = signer {
        packager = packager.with_signer(signer);
    }
    for file in &spec.files {
        let data = read_relative(base, &file.path)?;
        packager = match &file.patch_from {
            Some(source) => {
                let old = read_relative(base, source)?;
                packager.patch_file(&file.name, file.file_type, file.file_id, &old, &data)
            }
            None => packager.file(&file.name, file.file_type, file.file_id, data),
        };
    }
    Ok(packager.build().map_err(CliError::from)?)
}

fn read_relative(base: &Path, path: &Path) -> Result<Vec<u8>> {
    let full = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
    std::fs::read(&full).with_context(|| format!("reading {}", full.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_engine::image::{HEAD_SIZE, ImageHeader};
    use ota_test_helpers::prelude::*;
    use tempfile::TempDir;

    fn spec_json(patch: bool) -> String {
        let old = if patch {
            r#", "old_version": { "version_code": 256, "version_name": "1.0", "board_name": "sim-board" }"#
        } else {
            ""
        };
        let patch_from = if patch { r#", "patch_from": "old.bin""# } else { "" };
        format!(
            r#"{{
                "version": {{ "version_code": 512, "version_name": "2.0", "board_name": "sim-board" }},
                "files": [
                    {{ "name": "system.bin", "type": "system", "file_id": 4, "path": "system.bin"{patch_from} }}
                ]{old}
            }}"#
        )
    }

    #[test]
    fn test_build_reads_files_relative_to_spec() -> TestResult {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("system.bin"), ImageFixture::payload(0x3000, 1))?;
        let spec: PackageSpec = serde_json::from_str(&spec_json(false))?;

        let image = build(&spec, dir.path(), None)?;
        let header = ImageHeader::parse(image.get(..HEAD_SIZE).unwrap_or_default())?;
        assert_eq!(header.new_version.version_code, 512);
        assert!(header.old_version.is_none());
        assert!(header.dir.iter().any(|e| e.matches("system.bin") && e.length == 0x3000));
        Ok(())
    }

    #[test]
    fn test_build_ships_patch_against_source() -> TestResult {
        let dir = TempDir::new()?;
        let old = ImageFixture::payload(0x3000, 1);
        let mut new = old.clone();
        new.extend_from_slice(&[0x11; 64]);
        std::fs::write(dir.path().join("old.bin"), &old)?;
        std::fs::write(dir.path().join("system.bin"), &new)?;
        let spec: PackageSpec = serde_json::from_str(&spec_json(true))?;

        let image = build(&spec, dir.path(), None)?;
        let header = ImageHeader::parse(image.get(..HEAD_SIZE).unwrap_or_default())?;
        assert_eq!(header.old_version.map(|v| v.version_code), Some(256));
        let entry = must_some(header.dir.iter().find(|e| e.matches("system.bin")), "patch entry");
        assert!((entry.length as usize) < new.len());
        Ok(())
    }

    #[test]
    fn test_patch_without_old_version_is_rejected() -> TestResult {
        let mut spec: PackageSpec = serde_json::from_str(&spec_json(true))?;
        spec.old_version = None;
        assert!(build(&spec, Path::new("."), None).is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_spec_field_is_rejected() {
        let parsed = serde_json::from_str::<PackageSpec>(r#"{ "version": {}, "files": [], "compress": true }"#);
        assert!(parsed.is_err());
    }
}
