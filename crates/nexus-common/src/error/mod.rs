//! Error handling for NexusDB.
//!
//! This module provides the stable error codes shared by every NexusDB
//! component and the error type used by the common utilities.

mod code;
mod common;

pub use code::ErrorCode;
pub use common::NexusError;

/// Result type alias for NexusDB operations.
pub type NexusResult<T> = std::result::Result<T, NexusError>;
