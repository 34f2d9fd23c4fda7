//! System-wide constants for NexusDB.
//!
//! This module defines the memory sizing constants shared by the memory
//! governor and its consumers.

// =============================================================================
// Size Units
// =============================================================================

/// One kibibyte.
pub const KB: u64 = 1024;

/// One mebibyte.
pub const MB: u64 = 1024 * KB;

/// One gibibyte.
pub const GB: u64 = 1024 * MB;

/// One tebibyte.
pub const TB: u64 = 1024 * GB;

// =============================================================================
// Memory Capacity Constants
// =============================================================================

/// Sentinel capacity meaning "unlimited".
///
/// Kept at `i64::MAX` rather than `u64::MAX` so that adding two in-range
/// byte counts can never wrap.
pub const MAX_MEMORY: u64 = i64::MAX as u64;

/// Minimum allocation alignment (the alignment of `max_align_t` on 64-bit targets).
pub const MIN_ALIGNMENT: u16 = 16;

/// Maximum supported allocation alignment (one cache line).
pub const MAX_ALIGNMENT: u16 = 64;

/// Default capacity granted to a root pool at creation (128 MB).
pub const DEFAULT_POOL_INIT_CAPACITY: u64 = 128 * MB;

/// Default minimum capacity moved between pools in one arbitration (32 MB).
pub const DEFAULT_POOL_TRANSFER_CAPACITY: u64 = 32 * MB;

/// Default bound on arbitration waits and reclamation, in milliseconds.
pub const DEFAULT_RECLAIM_WAIT_MS: u64 = 60_000;

/// Default number of shared leaf pools.
pub const DEFAULT_NUM_SHARED_LEAF_POOLS: usize = 32;

// =============================================================================
// Reserved Pool Names
// =============================================================================

/// Name of the unlimited root pool used for system allocations.
pub const DEFAULT_ROOT_POOL_NAME: &str = "__default_root__";

/// Prefix of the shared leaf pool names.
pub const SHARED_LEAF_POOL_PREFIX: &str = "default_shared_leaf_pool_";

/// Prefix of generated root pool names.
pub const GENERATED_ROOT_POOL_PREFIX: &str = "default_root_";

/// Prefix of generated leaf pool names.
pub const GENERATED_LEAF_POOL_PREFIX: &str = "default_leaf_";

/// Name of the system leaf pool used for spilling.
pub const SPILL_POOL_NAME: &str = "_sys.spilling";
