//! Property-based tests for error classification.

use ota_errors::{ErrorClass, ErrorSeverity, ImageError, OtaError, StorageError};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_error_severity_ordering(a in 0u8..=3, b in 0u8..=3) {
        let sev = |v: u8| match v {
            0 => ErrorSeverity::Info,
            1 => ErrorSeverity::Warning,
            2 => ErrorSeverity::Error,
            _ => ErrorSeverity::Critical,
        };
        prop_assert_eq!(a.cmp(&b), sev(a).cmp(&sev(b)));
    }

    #[test]
    fn test_storage_messages_contain_reason(offset in any::<u32>(), reason in "[a-z ]{1,24}") {
        let err = StorageError::write(offset, 32, reason.clone());
        prop_assert!(err.to_string().contains(&reason));
    }

    #[test]
    fn test_timeouts_always_resumable(offset in any::<u32>()) {
        let err: OtaError = ImageError::Timeout { offset }.into();
        prop_assert_eq!(err.class(), ErrorClass::Transport);
        prop_assert!(err.is_resumable());
    }

    #[test]
    fn test_flash_failures_never_resumable(offset in any::<u32>(), len in 1u32..0x10000) {
        let err: OtaError = StorageError::erase(offset, len, "nack").into();
        prop_assert!(!err.is_resumable());
    }
}
