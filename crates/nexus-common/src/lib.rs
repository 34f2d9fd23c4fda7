//! # nexus-common
//!
//! Common types, errors, and utilities for NexusDB.
//!
//! This crate provides the foundational pieces used across the NexusDB
//! memory subsystem and its consumers. It includes:
//!
//! - **Constants**: Memory sentinels, alignment bounds, and defaults
//! - **Units**: `ByteSize` parsing and human-readable byte formatting
//! - **Errors**: Stable `ErrorCode`s and the `NexusError` type
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::units::{succinct_bytes, ByteSize};
//! use nexus_common::error::NexusResult;
//!
//! fn example() -> NexusResult<()> {
//!     let size: ByteSize = "256MB".parse()?;
//!     assert_eq!(succinct_bytes(size.as_u64()), "256.00MB");
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod error;
pub mod units;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorCode, NexusError, NexusResult};
pub use units::{succinct_bytes, ByteSize};
