//! Configuration errors.

/// Errors raised while loading or validating engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("Invalid '{field}': {reason}")]
    Invalid {
        /// Field name
        field: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Document could not be read
    #[error("Failed to read configuration: {0}")]
    Io(String),

    /// Secure boot key could not be loaded
    #[error("Invalid public key: {0}")]
    Key(String),
}

impl ConfigError {
    /// Create a validation error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
