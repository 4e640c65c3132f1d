//! Engine configuration
//!
//! All sizes are in bytes. Defaults match a NOR device with 4 KiB sectors and
//! a transport that delivers up to 128 KiB per request.

use std::path::Path;

use ota_crypto::ImageVerifyingKey;
use ota_errors::ConfigError;
use serde::{Deserialize, Serialize};

use crate::flash::SECTOR_SIZE;

/// Installation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Dual bank: write only the inactive mirror of every partition
    #[default]
    Mirror,
    /// Single bank: stage the whole image into the temp partition
    Recovery,
    /// Secondary stage: install a staged image into the live partitions
    RecoveryApp,
}

impl InstallMode {
    /// Whether the temp partition is the write target.
    pub fn uses_recovery(self) -> bool {
        matches!(self, InstallMode::Recovery | InstallMode::RecoveryApp)
    }

    /// Whether files are written partition by partition.
    pub fn writes_partitions(self) -> bool {
        matches!(self, InstallMode::Mirror | InstallMode::RecoveryApp)
    }
}

impl std::fmt::Display for InstallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallMode::Mirror => write!(f, "mirror"),
            InstallMode::Recovery => write!(f, "recovery"),
            InstallMode::RecoveryApp => write!(f, "recovery-app"),
        }
    }
}

/// OTA engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Installation strategy
    pub install_mode: InstallMode,

    /// Accept any image version and bump the parameter block version after commit
    pub no_version_control: bool,

    /// PEM public key; enables signature verification of the staged image
    pub secure_boot_key: Option<String>,

    /// Reader working buffer; one transport segment is this rounded down to the backend unit
    pub data_buffer_size: usize,

    /// Ring buffer between the reader and the flash writer
    pub rx_buffer_size: usize,

    /// Largest chunk the writer takes from the ring at once
    pub in_buffer_size: usize,

    /// Largest single transport request
    pub max_request_size: u32,

    /// Erase granule used for resume offsets and chunk rounding
    pub erase_align: u32,

    /// Forward progress between journal saves while a file is being written
    pub journal_save_granule: u32,

    /// Largest single flash program burst
    pub max_write_burst: usize,

    /// Flash read chunk
    pub read_segment: usize,

    /// Skip the erase pass at engine construction
    pub skip_init_erase: bool,

    /// Offset of the firmware version record inside the parameter file
    pub param_version_offset: u32,

    /// Length of the signature appended to a staged secure-boot image
    pub signature_len: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            install_mode: InstallMode::Mirror,
            no_version_control: false,
            secure_boot_key: None,
            data_buffer_size: 4 * 1024,
            rx_buffer_size: 16 * 1024,
            in_buffer_size: 16 * 1024,
            max_request_size: 128 * 1024,
            erase_align: SECTOR_SIZE,
            journal_save_granule: 128 * 1024,
            max_write_burst: 4 * 1024,
            read_segment: 4 * 1024,
            skip_init_erase: false,
            param_version_offset: 0x100,
            signature_len: 256,
        }
    }
}

impl OtaConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON, or a validation error.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Validate field ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.erase_align == 0 || !self.erase_align.is_power_of_two() {
            return Err(ConfigError::invalid(
                "erase_align",
                "must be a non-zero power of two",
            ));
        }
        if self.erase_align % SECTOR_SIZE != 0 {
            return Err(ConfigError::invalid(
                "erase_align",
                format!("must be a multiple of the {SECTOR_SIZE:#x} flash sector"),
            ));
        }
        if self.journal_save_granule == 0 || self.journal_save_granule % self.erase_align != 0 {
            return Err(ConfigError::invalid(
                "journal_save_granule",
                "must be a non-zero multiple of erase_align",
            ));
        }
        let align = self.erase_align as usize;
        if self.rx_buffer_size < align {
            return Err(ConfigError::invalid(
                "rx_buffer_size",
                "must hold at least one erase unit",
            ));
        }
        if self.in_buffer_size < align || self.in_buffer_size > self.rx_buffer_size {
            return Err(ConfigError::invalid(
                "in_buffer_size",
                "must be between erase_align and rx_buffer_size",
            ));
        }
        if self.data_buffer_size == 0 || self.data_buffer_size > self.rx_buffer_size {
            return Err(ConfigError::invalid(
                "data_buffer_size",
                "must be non-zero and not larger than rx_buffer_size",
            ));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::invalid("max_request_size", "must be non-zero"));
        }
        if self.max_write_burst == 0 {
            return Err(ConfigError::invalid("max_write_burst", "must be non-zero"));
        }
        if self.read_segment == 0 {
            return Err(ConfigError::invalid("read_segment", "must be non-zero"));
        }
        if self.secure_boot_key.is_some() {
            if self.install_mode != InstallMode::Recovery {
                return Err(ConfigError::invalid(
                    "secure_boot_key",
                    "signature checks apply to staged images in recovery mode",
                ));
            }
            let key = self.verifying_key()?;
            if key.is_some_and(|k| k.signature_len() != self.signature_len as usize) {
                return Err(ConfigError::invalid(
                    "signature_len",
                    "does not match the public key modulus",
                ));
            }
        }
        Ok(())
    }

    /// Parse the secure boot key, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Key`] when the PEM cannot be parsed.
    pub fn verifying_key(&self) -> Result<Option<ImageVerifyingKey>, ConfigError> {
        self.secure_boot_key
            .as_deref()
            .map(|pem| ImageVerifyingKey::from_pem(pem).map_err(|e| ConfigError::Key(e.to_string())))
            .transpose()
    }

    /// Whether staged images carry a signature.
    pub fn secure_boot(&self) -> bool {
        self.secure_boot_key.is_some()
    }

    /// Set the installation strategy.
    #[must_use]
    pub fn with_install_mode(mut self, mode: InstallMode) -> Self {
        self.install_mode = mode;
        self
    }

    /// Enable or disable version control.
    #[must_use]
    pub fn with_no_version_control(mut self, enabled: bool) -> Self {
        self.no_version_control = enabled;
        self
    }

    /// Configure the secure boot public key.
    #[must_use]
    pub fn with_secure_boot_key(mut self, pem: impl Into<String>) -> Self {
        self.secure_boot_key = Some(pem.into());
        self
    }

    /// Skip the construction-time erase pass.
    #[must_use]
    pub fn with_skip_init_erase(mut self, skip: bool) -> Self {
        self.skip_init_erase = skip;
        self
    }

    /// Set the reader, ring and writer buffer sizes.
    #[must_use]
    pub fn with_buffers(mut self, data: usize, rx: usize, input: usize) -> Self {
        self.data_buffer_size = data;
        self.rx_buffer_size = rx;
        self.in_buffer_size = input;
        self
    }

    /// Set the journal save granule.
    #[must_use]
    pub fn with_journal_save_granule(mut self, granule: u32) -> Self {
        self.journal_save_granule = granule;
        self
    }
}
