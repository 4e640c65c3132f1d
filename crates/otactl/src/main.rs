//! otactl - firmware update image tooling
//!
//! Builds, inspects and diffs update images on the host, and runs the update
//! engine against a file-backed simulated device so an image can be tried
//! before it ships.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{DiffArgs, InspectArgs, PackArgs, SimulateArgs, StatusArgs};
use crate::error::CliError;

#[derive(Parser)]
#[command(name = "otactl")]
#[command(about = "Firmware update tooling - build, inspect and simulate OTA images")]
#[command(version)]
#[command(long_about = "
otactl works with the images consumed by the OTA update engine.

It packs payload files into a (optionally signed) image, prints what an image
carries, creates delta patches, and installs an image into a simulated flash
file with the same engine a device runs. Simulated installs journal to a file,
so an interrupted run resumes where it stopped.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(long, global = true, help = "Output in JSON format for machine parsing")]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the header, directory and manifest of an image
    Inspect(InspectArgs),

    /// Build an image from a package description
    Pack(PackArgs),

    /// Create a delta patch between two files
    Diff(DiffArgs),

    /// Install an image into a simulated device
    Simulate(SimulateArgs),

    /// Show the journal of a simulated device
    Status(StatusArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("otactl={log_level},ota_engine={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Inspect(args) => commands::inspect::execute(args, cli.json),
        Commands::Pack(args) => commands::pack::execute(args, cli.json),
        Commands::Diff(args) => commands::diff::execute(args, cli.json),
        Commands::Simulate(args) => commands::simulate::execute(args, cli.json).await,
        Commands::Status(args) => commands::status::execute(args, cli.json),
    }
}

/// Process exit code for a failed command.
fn exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<CliError>() {
        Some(CliError::InvalidImage(_)) | Some(CliError::Json(_)) | Some(CliError::Manifest(_)) => 2,
        Some(CliError::BadSignature) => 3,
        Some(CliError::Upgrade(err)) => match err.class() {
            ota_errors::ErrorClass::Transport | ota_errors::ErrorClass::Cancelled => 4,
            ota_errors::ErrorClass::Declined => 7,
            _ => 5,
        },
        Some(CliError::InvalidConfiguration(_)) | Some(CliError::Config(_)) => 6,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    // --- Global flags ---

    #[test]
    fn test_parse_inspect_defaults() -> TestResult {
        let cli = Cli::try_parse_from(["otactl", "inspect", "update.bin"])?;
        assert!(!cli.json);
        assert_eq!(cli.verbose, 0);
        match &cli.command {
            Commands::Inspect(args) => {
                assert_eq!(args.image.to_str(), Some("update.bin"));
                assert!(args.key.is_none());
            }
            _ => return Err("expected Inspect command".into()),
        }
        Ok(())
    }

    #[test]
    fn test_parse_global_json_after_subcommand() -> TestResult {
        let cli = Cli::try_parse_from(["otactl", "inspect", "update.bin", "--json"])?;
        assert!(cli.json);
        Ok(())
    }

    #[test]
    fn test_parse_verbose_levels() -> TestResult {
        for (flag, level) in [("-v", 1), ("-vv", 2), ("-vvv", 3)] {
            let cli = Cli::try_parse_from(["otactl", flag, "status", "--journal", "nv.json"])?;
            assert_eq!(cli.verbose, level);
        }
        Ok(())
    }

    // --- Subcommands ---

    #[test]
    fn test_parse_pack_with_signer() -> TestResult {
        let cli = Cli::try_parse_from(["otactl", "pack", "pkg.json", "-o", "out.bin", "--sign", "key.pem"])?;
        match &cli.command {
            Commands::Pack(args) => {
                assert_eq!(args.spec.to_str(), Some("pkg.json"));
                assert_eq!(args.output.to_str(), Some("out.bin"));
                assert_eq!(args.sign.as_deref().and_then(|p| p.to_str()), Some("key.pem"));
            }
            _ => return Err("expected Pack command".into()),
        }
        Ok(())
    }

    #[test]
    fn test_parse_pack_requires_output() {
        assert!(Cli::try_parse_from(["otactl", "pack", "pkg.json"]).is_err());
    }

    #[test]
    fn test_parse_simulate_running_version_accepts_hex() -> TestResult {
        let cli = Cli::try_parse_from([
            "otactl",
            "simulate",
            "--table",
            "table.json",
            "--flash",
            "flash.bin",
            "--journal",
            "nv.json",
            "--image",
            "update.bin",
            "--running",
            "0x0102",
        ])?;
        match &cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.running, 0x0102);
                assert!(args.config.is_none());
                assert!(!args.from_temp);
            }
            _ => return Err("expected Simulate command".into()),
        }
        Ok(())
    }

    #[test]
    fn test_parse_simulate_rejects_bad_version() {
        let parsed = Cli::try_parse_from([
            "otactl", "simulate", "--table", "t.json", "--flash", "f.bin", "--journal", "nv.json", "--running", "1.2",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_exit_codes_follow_error_kind() {
        assert_eq!(exit_code(&CliError::BadSignature.into()), 3);
        assert_eq!(exit_code(&CliError::Upgrade(ota_errors::OtaError::Aborted).into()), 4);
        assert_eq!(exit_code(&CliError::InvalidImage("short".into()).into()), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
