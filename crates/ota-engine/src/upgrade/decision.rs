//! Whether an opened image applies to this device.

use ota_errors::OtaError;
use serde::Serialize;
use tracing::{info, warn};

use super::OtaUpgrade;
use crate::backend::BackendType;
use crate::breakpoint::{Breakpoint, BreakpointState};
use crate::manifest::Manifest;
use crate::version::FirmwareVersion;

/// Why an image was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    /// The journaled attempt came over another transport
    BackendChanged {
        /// Transport in the journal
        journaled: BackendType,
        /// Transport now attached
        attached: BackendType,
    },
    /// The image targets another board
    BoardMismatch {
        /// Board of the running firmware
        running: String,
        /// Board named by the image
        image: String,
    },
    /// A patch built against a different source version
    PatchSourceMismatch {
        /// Running version code
        running: u32,
        /// Source version code the patch expects
        source: u32,
    },
    /// Patches need version control to identify their source
    PatchWithoutVersionControl,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::BackendChanged { journaled, attached } => {
                write!(f, "backend changed from {journaled} to {attached}")
            }
            Refusal::BoardMismatch { running, image } => {
                write!(f, "image for board '{image}', running on '{running}'")
            }
            Refusal::PatchSourceMismatch { running, source } => {
                write!(f, "patch expects version {source:#x}, running {running:#x}")
            }
            Refusal::PatchWithoutVersionControl => f.write_str("patch image without version control"),
        }
    }
}

/// Outcome of the applicability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeDecision {
    /// The image must not be installed
    Refuse(Refusal),
    /// The running firmware is as new as the image
    UpToDate,
    /// Install, resuming whatever the journal allows
    Proceed,
    /// A different image was being installed; erase its leftovers first
    ProceedAfterReprepare,
}

impl UpgradeDecision {
    /// Decide for an image with `manifest` and payload checksum
    /// `data_checksum`, arriving over `backend`, given the journal and the
    /// running firmware.
    pub fn evaluate(
        bp: &Breakpoint,
        running: &FirmwareVersion,
        manifest: &Manifest,
        backend: BackendType,
        data_checksum: u32,
        no_version_control: bool,
    ) -> Self {
        if backend != BackendType::TempPart
            && bp.backend_type != BackendType::Unknown
            && bp.backend_type != backend
        {
            return Self::Refuse(Refusal::BackendChanged {
                journaled: bp.backend_type,
                attached: backend,
            });
        }
        if running.board_name != manifest.version.board_name {
            return Self::Refuse(Refusal::BoardMismatch {
                running: running.board_name.clone(),
                image: manifest.version.board_name.clone(),
            });
        }
        if let Some(source) = &manifest.old_version {
            if running.version_code != source.version_code {
                return Self::Refuse(Refusal::PatchSourceMismatch {
                    running: running.version_code,
                    source: source.version_code,
                });
            }
            if no_version_control {
                return Self::Refuse(Refusal::PatchWithoutVersionControl);
            }
        }

        let interrupted = matches!(
            bp.state,
            BreakpointState::WritingImg
                | BreakpointState::UpgradeWriting
                | BreakpointState::UpgradePending
        );
        let other_version = bp.new_version != 0 && bp.new_version != manifest.version.version_code;
        let other_payload = bp.data_checksum != 0 && bp.data_checksum != data_checksum;
        if interrupted && (other_version || other_payload) {
            return Self::ProceedAfterReprepare;
        }

        if !no_version_control && running.version_code >= manifest.version.version_code {
            return Self::UpToDate;
        }
        Self::Proceed
    }
}

impl OtaUpgrade {
    /// Evaluate the opened image and act on the decision.
    pub(super) fn apply_decision(&mut self, manifest: &Manifest) -> Result<(), OtaError> {
        let running = self.platform.current_version();
        let decision = UpgradeDecision::evaluate(
            self.journal.breakpoint(),
            &running,
            manifest,
            self.image.backend_type(),
            self.image.data_checksum()?,
            self.config.no_version_control,
        );
        match decision {
            UpgradeDecision::Proceed => {
                info!(from = %running, to = %manifest.version, "upgrade accepted");
                Ok(())
            }
            UpgradeDecision::ProceedAfterReprepare => {
                warn!(
                    journaled = self.journal.breakpoint().new_version,
                    image = manifest.version.version_code,
                    "journal belongs to another image, preparing again"
                );
                self.journal.update_state(BreakpointState::WritingImgFail)?;
                self.prepare()
            }
            UpgradeDecision::UpToDate => {
                warn!(running = %running, image = %manifest.version, "already up to date");
                self.journal.update_state(BreakpointState::WritingImgFail)?;
                Err(OtaError::declined(format!(
                    "running version {:#x} is not older than {:#x}",
                    running.version_code, manifest.version.version_code
                )))
            }
            UpgradeDecision::Refuse(reason) => {
                warn!(%reason, "image refused");
                self.journal.update_state(BreakpointState::WritingImgFail)?;
                Err(OtaError::declined(reason.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestFile;

    fn manifest(code: u32, board: &str, source: Option<u32>) -> Manifest {
        Manifest {
            version: FirmwareVersion::new(code, "v", board),
            old_version: source.map(|s| FirmwareVersion::new(s, "old", board)),
            files: vec![ManifestFile::default()],
        }
    }

    fn running(code: u32) -> FirmwareVersion {
        FirmwareVersion::new(code, "run", "board")
    }

    #[test]
    fn test_newer_image_proceeds() {
        let bp = Breakpoint::default();
        let d = UpgradeDecision::evaluate(&bp, &running(1), &manifest(2, "board", None), BackendType::Memory, 7, false);
        assert_eq!(d, UpgradeDecision::Proceed);
    }

    #[test]
    fn test_same_version_is_up_to_date_unless_unversioned() {
        let bp = Breakpoint::default();
        let m = manifest(2, "board", None);
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(2), &m, BackendType::Memory, 7, false),
            UpgradeDecision::UpToDate
        );
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(2), &m, BackendType::Memory, 7, true),
            UpgradeDecision::Proceed
        );
    }

    #[test]
    fn test_board_mismatch_refused() {
        let bp = Breakpoint::default();
        let d = UpgradeDecision::evaluate(&bp, &running(1), &manifest(2, "other", None), BackendType::Memory, 7, false);
        assert!(matches!(d, UpgradeDecision::Refuse(Refusal::BoardMismatch { .. })));
    }

    #[test]
    fn test_backend_change_refused_except_temp_partition() {
        let bp = Breakpoint {
            backend_type: BackendType::Usb,
            ..Breakpoint::default()
        };
        let m = manifest(2, "board", None);
        assert!(matches!(
            UpgradeDecision::evaluate(&bp, &running(1), &m, BackendType::Uart, 7, false),
            UpgradeDecision::Refuse(Refusal::BackendChanged { .. })
        ));
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(1), &m, BackendType::TempPart, 7, false),
            UpgradeDecision::Proceed
        );
    }

    #[test]
    fn test_patch_source_must_match() {
        let bp = Breakpoint::default();
        let m = manifest(3, "board", Some(2));
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(1), &m, BackendType::Memory, 7, false),
            UpgradeDecision::Refuse(Refusal::PatchSourceMismatch { running: 1, source: 2 })
        );
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(2), &m, BackendType::Memory, 7, true),
            UpgradeDecision::Refuse(Refusal::PatchWithoutVersionControl)
        );
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(2), &m, BackendType::Memory, 7, false),
            UpgradeDecision::Proceed
        );
    }

    #[test]
    fn test_interrupted_other_image_reprepares() {
        let bp = Breakpoint {
            state: BreakpointState::UpgradeWriting,
            new_version: 5,
            data_checksum: 7,
            ..Breakpoint::default()
        };
        let m = manifest(6, "board", None);
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(1), &m, BackendType::Memory, 7, false),
            UpgradeDecision::ProceedAfterReprepare
        );
        let same = manifest(5, "board", None);
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(1), &same, BackendType::Memory, 8, false),
            UpgradeDecision::ProceedAfterReprepare
        );
        assert_eq!(
            UpgradeDecision::evaluate(&bp, &running(1), &same, BackendType::Memory, 7, false),
            UpgradeDecision::Proceed
        );
    }

    #[test]
    fn test_refusal_display() {
        let r = Refusal::PatchSourceMismatch { running: 0x10, source: 0x20 };
        assert_eq!(r.to_string(), "patch expects version 0x20, running 0x10");
    }
}
