//! Stable error codes.

use std::fmt;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal error, such as a failed I/O call.
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,

    // Configuration errors (0x0100 - 0x01FF)
    /// Invalid configuration value.
    InvalidConfig = 0x0100,
    /// A singleton was initialized twice.
    AlreadyInitialized = 0x0101,
    /// A singleton was used before initialization.
    NotInitialized = 0x0102,
    /// A named object already exists.
    DuplicateName = 0x0103,

    // Memory errors (0x0200 - 0x02FF)
    /// A memory pool could not grow to satisfy a request.
    MemoryCapExceeded = 0x0200,
    /// The allocator backend refused to hand out bytes.
    AllocationFailed = 0x0201,
    /// A memory pool is no longer accepting reservations.
    PoolNotActive = 0x0202,
    /// A memory pool was not found.
    PoolNotFound = 0x0203,

    // Consistency errors (0x0300 - 0x03FF)
    /// Bookkeeping violated an invariant.
    Inconsistent = 0x0300,
    /// Memory was still in use when its owner was destroyed.
    MemoryLeak = 0x0301,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Configuration",
            0x02 => "Memory",
            0x03 => "Consistency",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::Internal.category(), "General");
        assert_eq!(ErrorCode::DuplicateName.category(), "Configuration");
        assert_eq!(ErrorCode::MemoryCapExceeded.category(), "Memory");
        assert_eq!(ErrorCode::MemoryLeak.category(), "Consistency");
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Internal.as_u16(), 0x0001);
        assert_eq!(ErrorCode::MemoryCapExceeded.as_u16(), 0x0200);
        assert_eq!(ErrorCode::MemoryCapExceeded.to_string(), "MemoryCapExceeded");
    }
}
