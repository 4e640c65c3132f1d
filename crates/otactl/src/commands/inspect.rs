//! Image inspection
//!
//! Decodes the head, re-checks every CRC the engine checks on the device and,
//! given a public key, verifies the signature appended after the data.

use anyhow::{Context, Result};
use ota_crypto::ImageVerifyingKey;
use ota_crypto::utils::compute_sha256_hex;
use ota_engine::image::{HEAD_SIZE, ImageHeader};
use ota_engine::manifest::{MANIFEST_FILE_NAME, Manifest};
use serde::Serialize;
use tracing::{debug, info};

use crate::commands::InspectArgs;
use crate::error::CliError;
use crate::output;

/// Everything `inspect` reports about an image.
#[derive(Debug, Serialize)]
pub struct ImageReport {
    pub header: ImageHeader,
    pub manifest: Option<Manifest>,
    pub sha256: String,
    pub data_checksum_ok: bool,
    pub files: Vec<FileCheck>,
    pub signature_valid: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct FileCheck {
    pub name: String,
    pub checksum_ok: bool,
}

/// Execute inspect command
pub fn execute(args: &InspectArgs, json: bool) -> Result<()> {
    let image = std::fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;
    let key = args
        .key
        .as_deref()
        .map(ImageVerifyingKey::load)
        .transpose()
        .map_err(CliError::from)?;

    let report = inspect(&image, key.as_ref())?;
    if json {
        output::print_json("image", &report);
    } else {
        output::print_image_human(&report.header, report.manifest.as_ref(), report.signature_valid);
        if !report.data_checksum_ok {
            println!("Data checksum mismatch");
        }
        for file in report.files.iter().filter(|f| !f.checksum_ok) {
            println!("Checksum mismatch in {}", file.name);
        }
        println!("SHA-256 {}", report.sha256);
    }

    if report.signature_valid == Some(false) {
        return Err(CliError::BadSignature.into());
    }
    if !report.data_checksum_ok || report.files.iter().any(|f| !f.checksum_ok) {
        return Err(CliError::InvalidImage("checksum mismatch".into()).into());
    }
    Ok(())
}

/// Decode and check `image`.
pub fn inspect(image: &[u8], key: Option<&ImageVerifyingKey>) -> Result<ImageReport, CliError> {
    let head = image
        .get(..HEAD_SIZE)
        .ok_or_else(|| CliError::InvalidImage(format!("{} bytes is shorter than the head", image.len())))?;
    let header = ImageHeader::parse(head).map_err(|e| CliError::InvalidImage(e.to_string()))?;
    let data_size = header.data_size as usize;
    let data = image.get(..data_size).ok_or_else(|| {
        CliError::InvalidImage(format!("data size {data_size:#x} exceeds file size {:#x}", image.len()))
    })?;

    let payload = data.get(usize::from(header.data_offset)..).unwrap_or_default();
    let data_checksum_ok = crc32fast::hash(payload) == header.data_checksum;

    let files = header
        .dir
        .iter()
        .map(|entry| {
            let start = entry.offset as usize;
            let bytes = data.get(start..start.saturating_add(entry.length as usize));
            FileCheck {
                name: entry.name.clone(),
                checksum_ok: bytes.is_some_and(|b| crc32fast::hash(b) == entry.checksum),
            }
        })
        .collect();

    let manifest = match header.dir.iter().find(|e| e.matches(MANIFEST_FILE_NAME)) {
        Some(entry) => {
            let start = entry.offset as usize;
            let xml = data
                .get(start..start.saturating_add(entry.length as usize))
                .ok_or_else(|| CliError::InvalidImage("manifest lies outside the image".into()))?;
            let xml = String::from_utf8_lossy(xml);
            Some(Manifest::parse(&xml)?)
        }
        None => None,
    };

    let signature_valid = key.map(|key| {
        let sig = image.get(data_size..data_size.saturating_add(key.signature_len()));
        let valid = sig.is_some_and(|sig| key.verify(data, sig).is_ok());
        debug!(valid, sig_len = key.signature_len(), "signature checked");
        valid
    });

    info!(version = %header.new_version, size = header.data_size, "image inspected");
    Ok(ImageReport {
        sha256: compute_sha256_hex(data),
        header,
        manifest,
        data_checksum_ok,
        files,
        signature_valid,
    })
}
