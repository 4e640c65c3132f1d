//! Unit tests for error variants.
//!
//! Tests Display implementations, classification and From conversions.

use ota_errors::{
    ConfigError, ErrorClass, ErrorSeverity, ImageError, JournalError, ManifestError, OtaError,
    PatchError, Result, StorageError,
};

mod classification_tests {
    use super::*;

    #[test]
    fn test_every_component_error_wraps() -> Result<()> {
        let errors: Vec<OtaError> = vec![
            StorageError::erase(0, 0x1000, "timeout").into(),
            ImageError::NotOpen.into(),
            ManifestError::NotXml.into(),
            JournalError::SlotsFull { file_id: 9 }.into(),
            PatchError::failed("bad opcode").into(),
            ConfigError::invalid("erase_align", "zero").into(),
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
            let _: &dyn std::error::Error = &err;
        }
        Ok(())
    }

    #[test]
    fn test_only_transport_and_cancel_resume() -> Result<()> {
        let resumable: Vec<OtaError> = vec![
            ImageError::transport("link lost").into(),
            ImageError::Timeout { offset: 0x4000 }.into(),
            ImageError::Cancelled.into(),
            OtaError::Aborted,
            std::io::Error::other("eof").into(),
        ];
        for err in resumable {
            assert!(err.is_resumable(), "{err} should be resumable");
        }

        let fatal: Vec<OtaError> = vec![
            StorageError::write(0, 4, "nack").into(),
            ImageError::HeaderChecksum {
                expected: 1,
                actual: 2,
            }
            .into(),
            ManifestError::TooManyFiles { count: 16, max: 15 }.into(),
            OtaError::UnknownPartition { file_id: 3 },
            OtaError::declined("up to date"),
            OtaError::signature("mismatch"),
        ];
        for err in fatal {
            assert!(!err.is_resumable(), "{err} should not be resumable");
        }
        Ok(())
    }

    #[test]
    fn test_class_mapping() -> Result<()> {
        let cases: Vec<(OtaError, ErrorClass)> = vec![
            (
                StorageError::read(0, 1, "x").into(),
                ErrorClass::FlashIo,
            ),
            (
                StorageError::Misaligned {
                    offset: 1,
                    len: 1,
                    align: 0x1000,
                }
                .into(),
                ErrorClass::Precondition,
            ),
            (
                ManifestError::ChecksumMismatch {
                    expected: 0,
                    actual: 1,
                }
                .into(),
                ErrorClass::Integrity,
            ),
            (
                OtaError::VerifyFailed {
                    file: "app.bin".into(),
                    expected: 1,
                    actual: 2,
                },
                ErrorClass::Integrity,
            ),
            (JournalError::store("full").into(), ErrorClass::FlashIo),
            (
                PatchError::ResumeUnsupported { offset: 0x1000 }.into(),
                ErrorClass::Precondition,
            ),
            (ConfigError::Parse("eof".into()).into(), ErrorClass::Config),
            (OtaError::declined("board"), ErrorClass::Declined),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{err}");
        }
        Ok(())
    }

    #[test]
    fn test_severity() -> Result<()> {
        assert_eq!(
            OtaError::from(StorageError::WriteProtected).severity(),
            ErrorSeverity::Warning
        );
        assert_eq!(
            OtaError::declined("same version").severity(),
            ErrorSeverity::Info
        );
        assert_eq!(
            OtaError::FileTooLarge {
                file_id: 4,
                size: 2,
                max: 1
            }
            .severity(),
            ErrorSeverity::Critical
        );
        Ok(())
    }
}

mod display_tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() -> Result<()> {
        let msg = ManifestError::SizeMismatch {
            name: "app.bin".into(),
            declared: 10,
            actual: 12,
        }
        .to_string();
        assert!(msg.contains("app.bin"));
        assert!(msg.contains("10"));
        assert!(msg.contains("12"));

        let msg = OtaError::StorageMismatch {
            file_id: 4,
            expected: 1,
            actual: 0,
        }
        .to_string();
        assert!(msg.contains("file id 4"));

        let msg = JournalError::InvalidLength {
            expected: 80,
            actual: 12,
        }
        .to_string();
        assert!(msg.contains("80"));
        Ok(())
    }
}
