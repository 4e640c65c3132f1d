//! Convenience re-exports for test suites.
//!
//! ```rust,ignore
//! use ota_test_helpers::prelude::*;
//! ```

pub use crate::must::{must_err, must_some};

#[cfg(feature = "mock")]
pub use crate::mock::{FaultyBackend, FaultyFlash, FaultyNvStore, FnSink, PowerCut, RecordingSink};

#[cfg(feature = "fixtures")]
pub use crate::fixtures::{
    ImageFixture, SimBoard, TableFixture, TEST_BOARD, TEST_SIGNING_KEY_PEM, TEST_VERIFYING_KEY_PEM,
};

/// Result type for tests that use `?`.
pub type TestResult = Result<(), Box<dyn std::error::Error>>;
