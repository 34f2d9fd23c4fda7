//! Memory subsystem errors.

use nexus_common::units::succinct_bytes;
use nexus_common::ErrorCode;
use thiserror::Error;

use crate::pool::PoolState;

fn human(bytes: &u64) -> String {
    succinct_bytes(*bytes)
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors that can occur while tracking or arbitrating memory.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum MemoryError {
    /// The process-wide memory manager was already initialized.
    #[error("the memory manager has already been set: {existing}")]
    AlreadyInitialized { existing: String },

    /// The process-wide memory manager was used before initialization.
    #[error("the memory manager is not set")]
    NotInitialized,

    /// A pool with the same name is still registered.
    #[error("duplicate memory pool name found: {name}")]
    DuplicatePool { name: String },

    /// The allocator backend and the manager disagree on capacity.
    #[error("memory allocator capacity {allocator} must be the same as memory manager capacity {manager}")]
    CapacityMismatch { allocator: u64, manager: u64 },

    /// An alignment failed validation.
    #[error("invalid alignment {alignment}: {reason}")]
    InvalidAlignment { alignment: u64, reason: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A pool could not grow enough to satisfy a reservation.
    #[error(
        "exceeded memory pool cap of {} with max {} when requesting {}, memory manager cap is {}, requestor '{pool}' with current usage {}",
        human(.capacity),
        human(.max_capacity),
        human(.requested),
        human(.manager_capacity),
        human(.used)
    )]
    CapacityExceeded {
        pool: String,
        requested: u64,
        used: u64,
        capacity: u64,
        max_capacity: u64,
        manager_capacity: u64,
    },

    /// The allocator backend refused to hand out bytes.
    #[error("memory pool '{pool}' failed to allocate {} from the allocator", human(.bytes))]
    AllocationFailed { pool: String, bytes: u64 },

    /// The pool no longer accepts reservations.
    #[error("memory pool '{pool}' is {state} and cannot take new reservations")]
    PoolNotActive { pool: String, state: PoolState },

    /// The operation does not apply to this kind of pool.
    #[error("invalid operation on memory pool '{pool}': {reason}")]
    InvalidOperation { pool: String, reason: String },

    /// A pool was dropped that the manager never registered.
    #[error("the dropped memory pool {name} not found")]
    PoolNotFound { name: String },

    /// A pool was destroyed while still holding memory.
    #[error("memory pool '{pool}' destroyed with {} still in use", human(.used))]
    UsageLeak { pool: String, used: u64 },

    /// Byte accounting broke an invariant.
    #[error("memory accounting is inconsistent: {message}")]
    Inconsistent { message: String },

    /// Pools were still alive when the manager was torn down.
    #[error("there are unexpected alive memory pools allocated by user on memory manager destruction:\n{report}")]
    LeakedPools { report: String },

    /// Options could not be parsed from TOML.
    #[error("failed to parse memory options: {0}")]
    Toml(#[from] toml::de::Error),

    /// Options could not be written as TOML.
    #[error("failed to serialize memory options: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// An options file could not be read or written.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl MemoryError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Creates an accounting consistency error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent {
            message: message.into(),
        }
    }

    /// Returns true if this error signals memory pressure.
    ///
    /// This is the only kind a consumer is expected to handle, for example by
    /// spilling or failing its query.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::AllocationFailed { .. } | Self::PoolNotActive { .. }
        )
    }

    /// Returns true if this error proves a bookkeeping bug.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PoolNotFound { .. }
                | Self::UsageLeak { .. }
                | Self::Inconsistent { .. }
                | Self::LeakedPools { .. }
        )
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::DuplicatePool { .. } => ErrorCode::DuplicateName,
            Self::CapacityMismatch { .. }
            | Self::InvalidAlignment { .. }
            | Self::Config { .. }
            | Self::Toml(_)
            | Self::TomlSerialize(_) => ErrorCode::InvalidConfig,
            Self::CapacityExceeded { .. } => ErrorCode::MemoryCapExceeded,
            Self::AllocationFailed { .. } => ErrorCode::AllocationFailed,
            Self::PoolNotActive { .. } => ErrorCode::PoolNotActive,
            Self::InvalidOperation { .. } => ErrorCode::NotSupported,
            Self::PoolNotFound { .. } => ErrorCode::PoolNotFound,
            Self::UsageLeak { .. } | Self::LeakedPools { .. } => ErrorCode::MemoryLeak,
            Self::Inconsistent { .. } => ErrorCode::Inconsistent,
            Self::Io { .. } => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MemoryError::config("bad alignment");
        assert!(matches!(err, MemoryError::Config { ref message } if message == "bad alignment"));
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_capacity_exceeded_message() {
        let err = MemoryError::CapacityExceeded {
            pool: "q1".to_string(),
            requested: 2048,
            used: 1024,
            capacity: 1024,
            max_capacity: 4096,
            manager_capacity: 8192,
        };
        let message = err.to_string();
        assert!(message.contains("q1"));
        assert!(message.contains("2.00KB"));
        assert!(message.contains("4.00KB"));
    }

    #[test]
    fn test_is_capacity_exhausted() {
        let err = MemoryError::AllocationFailed {
            pool: "leaf".to_string(),
            bytes: 64,
        };
        assert!(err.is_capacity_exhausted());
        assert!(!err.is_fatal());
        assert!(!MemoryError::NotInitialized.is_capacity_exhausted());
    }

    #[test]
    fn test_is_fatal() {
        let err = MemoryError::UsageLeak {
            pool: "leaf".to_string(),
            used: 16,
        };
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::MemoryLeak);

        assert!(MemoryError::inconsistent("overflow").is_fatal());
        assert!(!MemoryError::DuplicatePool {
            name: "q1".to_string()
        }
        .is_fatal());
    }
}
