//! Memory manager options.
//!
//! Options can be built in code or loaded from TOML:
//!
//! ```toml
//! capacity = "8GB"
//! query_memory_capacity = "6GB"
//! arbitrator_kind = "shared"
//! reclaim_policy = "largest_first"
//! memory_pool_init_capacity = "64MB"
//! memory_pool_transfer_capacity = "16MB"
//! memory_reclaim_wait_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use nexus_common::constants::{
    DEFAULT_NUM_SHARED_LEAF_POOLS, DEFAULT_POOL_INIT_CAPACITY, DEFAULT_POOL_TRANSFER_CAPACITY,
    DEFAULT_RECLAIM_WAIT_MS, MB, MIN_ALIGNMENT,
};
use nexus_common::units::ByteSize;
use serde::{Deserialize, Serialize};

use crate::allocator::alignment_check;
use crate::arbitrator::{ArbitratorConfig, ArbitratorKind, ReclaimPolicyKind};
use crate::error::{MemoryError, MemoryResult};

/// Memory manager configuration.
///
/// # Example
///
/// ```rust
/// use nexus_memory::config::MemoryManagerOptions;
///
/// let options = MemoryManagerOptions::from_toml_str("capacity = \"1GB\"").unwrap();
/// assert_eq!(options.capacity.as_u64(), 1 << 30);
/// assert!(options.check_usage_leak);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagerOptions {
    /// Memory budget. Must match the allocator's capacity.
    /// Default: unlimited
    pub capacity: ByteSize,

    /// Budget available to query root pools, capped by `capacity`.
    /// Default: unlimited
    pub query_memory_capacity: ByteSize,

    /// Allocation alignment. Raised to the minimum alignment if smaller.
    /// Default: 16
    pub alignment: u16,

    /// Arbitrator implementation.
    /// Default: noop
    pub arbitrator_kind: ArbitratorKind,

    /// Candidate ordering used by the shared arbitrator.
    /// Default: largest_first
    pub reclaim_policy: ReclaimPolicyKind,

    /// Capacity granted to a root pool at creation.
    /// Default: 128MB
    pub memory_pool_init_capacity: ByteSize,

    /// Minimum capacity moved per growth request.
    /// Default: 32MB
    pub memory_pool_transfer_capacity: ByteSize,

    /// Bound on arbitration waits and reclamation, in milliseconds.
    /// Default: 60000
    pub memory_reclaim_wait_ms: u64,

    /// Track usage of pools under the default root.
    /// Default: false
    pub track_default_usage: bool,

    /// Record every allocation for diagnostics.
    /// Default: false
    pub debug_enabled: bool,

    /// Fail when pools are still alive at manager teardown.
    /// Default: true
    pub check_usage_leak: bool,

    /// Panic instead of returning capacity errors.
    /// Default: false
    pub fail_on_allocation_failure: bool,

    /// Number of shared leaf pools. Zero is raised to one.
    /// Default: 32
    pub num_shared_leaf_pools: usize,
}

impl Default for MemoryManagerOptions {
    fn default() -> Self {
        Self {
            capacity: ByteSize::UNLIMITED,
            query_memory_capacity: ByteSize::UNLIMITED,
            alignment: MIN_ALIGNMENT,
            arbitrator_kind: ArbitratorKind::Noop,
            reclaim_policy: ReclaimPolicyKind::LargestFirst,
            memory_pool_init_capacity: ByteSize::new(DEFAULT_POOL_INIT_CAPACITY),
            memory_pool_transfer_capacity: ByteSize::new(DEFAULT_POOL_TRANSFER_CAPACITY),
            memory_reclaim_wait_ms: DEFAULT_RECLAIM_WAIT_MS,
            track_default_usage: false,
            debug_enabled: false,
            check_usage_leak: true,
            fail_on_allocation_failure: false,
            num_shared_leaf_pools: DEFAULT_NUM_SHARED_LEAF_POOLS,
        }
    }
}

impl MemoryManagerOptions {
    /// Creates options with a fixed capacity and shared arbitration.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: ByteSize::new(capacity),
            arbitrator_kind: ArbitratorKind::Shared,
            ..Default::default()
        }
    }

    /// Creates a small configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            capacity: ByteSize::new(256 * MB),
            arbitrator_kind: ArbitratorKind::Shared,
            memory_pool_init_capacity: ByteSize::new(8 * MB),
            memory_pool_transfer_capacity: ByteSize::new(MB),
            memory_reclaim_wait_ms: 1_000, // Fail fast
            track_default_usage: true,
            num_shared_leaf_pools: 4,
            ..Default::default()
        }
    }

    /// Parses options from a TOML document. Missing fields take defaults.
    pub fn from_toml_str(input: &str) -> MemoryResult<Self> {
        let options: Self = toml::from_str(input)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    /// Renders the options as TOML.
    pub fn to_toml(&self) -> MemoryResult<String> {
        Ok(toml::to_string(self)?)
    }

    /// Validates the options.
    pub fn validate(&self) -> MemoryResult<()> {
        alignment_check(0, self.effective_alignment())?;
        if self.capacity.as_u64() == 0 {
            return Err(MemoryError::config("capacity must be positive"));
        }
        if self.memory_reclaim_wait_ms == 0 {
            return Err(MemoryError::config(
                "memory_reclaim_wait_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the alignment the manager uses.
    #[must_use]
    pub fn effective_alignment(&self) -> u16 {
        self.alignment.max(MIN_ALIGNMENT)
    }

    /// Returns the reclaim wait as a duration.
    #[must_use]
    pub fn reclaim_wait(&self) -> Duration {
        Duration::from_millis(self.memory_reclaim_wait_ms)
    }

    /// Returns the arbitrator parameters these options describe.
    #[must_use]
    pub fn arbitrator_config(&self) -> ArbitratorConfig {
        ArbitratorConfig {
            kind: self.arbitrator_kind,
            capacity: self.query_memory_capacity.min(self.capacity).as_u64(),
            memory_pool_init_capacity: self.memory_pool_init_capacity.as_u64(),
            memory_pool_transfer_capacity: self.memory_pool_transfer_capacity.as_u64(),
            reclaim_wait: self.reclaim_wait(),
            reclaim_policy: self.reclaim_policy,
        }
    }

    /// Sets the arbitrator kind.
    #[must_use]
    pub fn with_arbitrator_kind(mut self, kind: ArbitratorKind) -> Self {
        self.arbitrator_kind = kind;
        self
    }

    /// Sets the reclaim policy.
    #[must_use]
    pub fn with_reclaim_policy(mut self, policy: ReclaimPolicyKind) -> Self {
        self.reclaim_policy = policy;
        self
    }

    /// Sets the query memory capacity.
    #[must_use]
    pub fn with_query_memory_capacity(mut self, bytes: u64) -> Self {
        self.query_memory_capacity = ByteSize::new(bytes);
        self
    }

    /// Sets the initial root pool capacity.
    #[must_use]
    pub fn with_init_capacity(mut self, bytes: u64) -> Self {
        self.memory_pool_init_capacity = ByteSize::new(bytes);
        self
    }

    /// Sets the transfer capacity.
    #[must_use]
    pub fn with_transfer_capacity(mut self, bytes: u64) -> Self {
        self.memory_pool_transfer_capacity = ByteSize::new(bytes);
        self
    }

    /// Sets the reclaim wait in milliseconds.
    #[must_use]
    pub fn with_reclaim_wait_ms(mut self, millis: u64) -> Self {
        self.memory_reclaim_wait_ms = millis;
        self
    }

    /// Sets the alignment.
    #[must_use]
    pub fn with_alignment(mut self, alignment: u16) -> Self {
        self.alignment = alignment;
        self
    }

    /// Enables or disables usage tracking under the default root.
    #[must_use]
    pub fn with_track_default_usage(mut self, enabled: bool) -> Self {
        self.track_default_usage = enabled;
        self
    }

    /// Enables or disables debug mode.
    #[must_use]
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    /// Enables or disables the teardown leak check.
    #[must_use]
    pub fn with_check_usage_leak(mut self, enabled: bool) -> Self {
        self.check_usage_leak = enabled;
        self
    }

    /// Enables or disables panicking on allocation failure.
    #[must_use]
    pub fn with_fail_on_allocation_failure(mut self, enabled: bool) -> Self {
        self.fail_on_allocation_failure = enabled;
        self
    }

    /// Sets the number of shared leaf pools.
    #[must_use]
    pub fn with_num_shared_leaf_pools(mut self, count: usize) -> Self {
        self.num_shared_leaf_pools = count;
        self
    }
}
