//! Errors raised by the common utilities.

use thiserror::Error;

use super::ErrorCode;

/// The error type for NexusDB common utilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NexusError {
    /// A byte size string could not be parsed.
    #[error("invalid byte size '{input}': {reason}")]
    InvalidByteSize {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl NexusError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidByteSize { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Creates a byte size parse error.
    #[must_use]
    pub fn invalid_byte_size(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidByteSize {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            NexusError::invalid_byte_size("12XB", "unknown unit").code(),
            ErrorCode::InvalidConfig
        );
    }

    #[test]
    fn test_error_display() {
        let err = NexusError::invalid_byte_size("12XB", "unknown unit 'XB'");
        assert_eq!(err.to_string(), "invalid byte size '12XB': unknown unit 'XB'");
    }
}
