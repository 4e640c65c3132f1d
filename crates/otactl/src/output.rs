//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use ota_engine::breakpoint::BreakpointState;
use ota_engine::event::{OtaEvent, OtaState};
use ota_engine::image::ImageHeader;
use ota_engine::manifest::Manifest;
use ota_engine::upgrade::UpgradeStatus;
use serde::Serialize;
use serde_json::json;

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "chain": error.chain().skip(1).map(ToString::to_string).collect::<Vec<_>>(),
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format error as JSON: {e}"),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    for cause in error.chain().skip(1) {
        eprintln!("  {} {}", "Caused by:".yellow(), cause);
    }
}

/// Print `value` wrapped in a success envelope.
pub fn print_json<T: Serialize>(key: &str, value: &T) {
    let output = json!({ "success": true, key: value });
    match serde_json::to_string_pretty(&output) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Failed to format {key} as JSON: {e}"),
    }
}

/// Print a one-line success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an image head and its manifest in human format
pub fn print_image_human(header: &ImageHeader, manifest: Option<&Manifest>, signature: Option<bool>) {
    println!("{}", "Image:".bold());
    println!("  Target:   {} ({:#x})", header.new_version.to_string().cyan(), header.new_version.version_code);
    match &header.old_version {
        Some(old) => println!("  Patch of: {} ({:#x})", old, old.version_code),
        None => println!("  Kind:     full image"),
    }
    println!("  Size:     {} bytes, data CRC {:#010x}", header.data_size, header.data_checksum);
    println!("  Layout:   header v{}, flags {:#06x}", header.header_version, header.flag);

    println!("{}", "Directory:".bold());
    for entry in &header.dir {
        println!(
            "  {:<12} {:>#10x} {:>10} {}",
            entry.name,
            entry.offset,
            entry.length,
            format!("{:#010x}", entry.checksum).dimmed()
        );
    }

    if let Some(manifest) = manifest {
        println!("{}", "Manifest:".bold());
        for file in &manifest.files {
            println!(
                "  {:<12} {:<9} id {:<2} {:>10} bytes {}",
                file.name,
                file.file_type.keyword(),
                file.file_id,
                file.size,
                format!("{:#010x}", file.checksum).dimmed()
            );
        }
    }

    match signature {
        Some(true) => println!("{} {}", "Signature:".bold(), "valid".green()),
        Some(false) => println!("{} {}", "Signature:".bold(), "INVALID".red().bold()),
        None => {}
    }
}

/// Print a journal snapshot in human format
pub fn print_status_human(status: Option<&UpgradeStatus>) {
    let Some(status) = status else {
        println!("{}", "No upgrade journaled".yellow());
        return;
    };

    println!("{} {}", "State:".bold(), state_label(status.state));
    println!("  In progress: {}", yes_no(status.in_progress));
    println!("  Running:     {}", yes_no(status.running));
    println!("  Transport:   {:?}", status.backend);
    println!("  New version: {:#x}", status.new_version);
    if let Some(file) = &status.current_file {
        println!("  Cursor:      {} at {:#x}", file, status.write_offset);
    }
    if !status.files.is_empty() {
        println!("{}", "Files:".bold());
        for slot in &status.files {
            println!("  id {:<3} {}", slot.file_id, slot.state);
        }
    }
}

/// Print one engine event as it arrives
pub fn print_event_human(event: &OtaEvent) {
    match event {
        OtaEvent::State { to, .. } => {
            let label = to.to_string();
            let colored = match to {
                OtaState::Done => label.green().bold(),
                OtaState::Fail | OtaState::Cancel => label.red().bold(),
                _ => label.cyan(),
            };
            println!("{} {}", "→".dimmed(), colored);
        }
        OtaEvent::Progress(pct) => println!("  {}", format!("{pct:>3}%").dimmed()),
        OtaEvent::ImageValid(true) => println!("  image {}", "valid".green()),
        OtaEvent::ImageValid(false) => println!("  image {}", "invalid".red()),
    }
}

fn state_label(state: BreakpointState) -> ColoredString {
    let label = state.to_string();
    if state.is_in_progress() {
        label.yellow().bold()
    } else {
        label.normal()
    }
}

fn yes_no(value: bool) -> ColoredString {
    if value { "yes".green() } else { "no".normal() }
}
