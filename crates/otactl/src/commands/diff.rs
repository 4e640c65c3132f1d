//! Delta patch creation

use anyhow::{Context, Result};
use ota_engine::patch::create_patch;
use serde_json::json;
use tracing::info;

use crate::commands::DiffArgs;
use crate::output;

/// Execute diff command
pub fn execute(args: &DiffArgs, json: bool) -> Result<()> {
    let old = std::fs::read(&args.old).with_context(|| format!("reading {}", args.old.display()))?;
    let new = std::fs::read(&args.new).with_context(|| format!("reading {}", args.new.display()))?;

    let patch = create_patch(&old, &new);
    std::fs::write(&args.output, &patch).with_context(|| format!("writing {}", args.output.display()))?;
    info!(old = old.len(), new = new.len(), patch = patch.len(), "patch written");

    if json {
        output::print_json(
            "patch",
            &json!({
                "output": args.output,
                "old_size": old.len(),
                "new_size": new.len(),
                "patch_size": patch.len(),
                "new_crc32": crc32fast::hash(&new),
            }),
        );
    } else {
        output::print_success(&format!(
            "Patch {} -> {}: {} bytes (target {} bytes, CRC {:#010x})",
            args.old.display(),
            args.new.display(),
            patch.len(),
            new.len(),
            crc32fast::hash(&new)
        ));
    }
    Ok(())
}
