//! Journal status of a simulated device

use anyhow::Result;
use ota_engine::breakpoint::is_ota_running;
use ota_engine::sim::FileNvStore;
use ota_engine::upgrade::read_status;
use serde_json::json;

use crate::commands::StatusArgs;
use crate::error::CliError;
use crate::output;

/// Execute status command
pub fn execute(args: &StatusArgs, json: bool) -> Result<()> {
    let store = FileNvStore::new(&args.journal);
    let status = read_status(&store).map_err(ota_errors::OtaError::from).map_err(CliError::from)?;
    let running = is_ota_running(&store).map_err(ota_errors::OtaError::from).map_err(CliError::from)?;

    if json {
        output::print_json(
            "status",
            &json!({
                "journal": status,
                "is_in_progress": status.as_ref().is_some_and(|s| s.in_progress),
                "is_ota_running": running,
            }),
        );
    } else {
        output::print_status_human(status.as_ref());
    }
    Ok(())
}
