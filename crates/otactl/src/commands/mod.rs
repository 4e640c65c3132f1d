//! Command implementations for otactl

pub mod diff;
pub mod inspect;
pub mod pack;
pub mod simulate;
pub mod status;

use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct InspectArgs {
    /// Image file
    pub image: PathBuf,
    /// Verify the appended signature with this public key (PEM)
    #[arg(short, long)]
    pub key: Option<PathBuf>,
}

#[derive(Args)]
pub struct PackArgs {
    /// Package description (JSON)
    pub spec: PathBuf,
    /// Output image path
    #[arg(short, long)]
    pub output: PathBuf,
    /// Sign the image with this private key (PKCS#8 PEM)
    #[arg(long, env = "OTACTL_SIGNING_KEY")]
    pub sign: Option<PathBuf>,
}

#[derive(Args)]
pub struct DiffArgs {
    /// File the device already has
    pub old: PathBuf,
    /// File to rebuild on the device
    pub new: PathBuf,
    /// Output patch path
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Partition table (JSON)
    #[arg(long)]
    pub table: PathBuf,
    /// Flash contents; created erased when missing and updated in place
    #[arg(long)]
    pub flash: PathBuf,
    /// Size of a newly created flash file
    #[arg(long, default_value = "0x400000", value_parser = parse_number)]
    pub flash_size: u32,
    /// Journal store; keeps the breakpoint between runs
    #[arg(long)]
    pub journal: PathBuf,
    /// Image to install
    #[arg(long, required_unless_present = "from_temp")]
    pub image: Option<PathBuf>,
    /// Install the image staged in the temp partition
    #[arg(long, conflicts_with = "image")]
    pub from_temp: bool,
    /// Version code of the running firmware
    #[arg(long, default_value = "0", value_parser = parse_number)]
    pub running: u32,
    /// Version name of the running firmware
    #[arg(long, default_value = "")]
    pub running_name: String,
    /// Board of the running firmware
    #[arg(long, default_value = "")]
    pub board: String,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Journal store of a simulated device
    #[arg(long)]
    pub journal: PathBuf,
}

/// Number in C notation: decimal, `0x` hex or leading-zero octal.
fn parse_number(s: &str) -> Result<u32, String> {
    ota_engine::manifest::parse_c_ulong(s).ok_or_else(|| format!("`{s}` is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_accepts_c_notation() {
        assert_eq!(parse_number("0x400000"), Ok(0x40_0000));
        assert_eq!(parse_number("256"), Ok(256));
        assert_eq!(parse_number("010"), Ok(8));
        assert!(parse_number("4M").is_err());
    }
}
