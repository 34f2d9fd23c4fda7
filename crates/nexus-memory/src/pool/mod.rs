//! Memory pool tree.
//!
//! Every byte a query operator uses is accounted against a [`MemoryPool`].
//! Pools form a tree:
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │   root pool (aggregate)      │  holds capacity granted
//!            │   capacity / max capacity    │  by the arbitrator
//!            └──────────────┬───────────────┘
//!                 ┌─────────┴──────────┐
//!        ┌────────▼───────┐   ┌────────▼───────┐
//!        │ aggregate child│   │   leaf pool    │  services allocations
//!        └────────┬───────┘   └────────────────┘
//!        ┌────────▼───────┐
//!        │   leaf pool    │
//!        └────────────────┘
//! ```
//!
//! - **Capacity** lives on the root. Descendants report the root's capacity.
//! - **Usage** is reserved on leaves and propagated to every ancestor, so an
//!   aggregate's usage is always the sum of its children's.
//! - **Growth**: when a reservation does not fit, the root asks its
//!   [`PoolGovernor`] for more capacity before failing.
//! - **Lifetime**: children keep their parent alive. A pool is destroyed when
//!   its last `Arc` is released, at which point it must hold no memory.

mod allocation;
mod node;
mod stats;

use std::fmt;

use nexus_common::constants::{MAX_MEMORY, MIN_ALIGNMENT};

use crate::error::MemoryResult;

pub use node::MemoryPool;
pub use stats::MemoryPoolStats;

/// The two shapes of pool in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Terminal pool that services allocations.
    Leaf,
    /// Internal pool that owns children and never allocates directly.
    Aggregate,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf => f.write_str("LEAF"),
            Self::Aggregate => f.write_str("AGGREGATE"),
        }
    }
}

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PoolState {
    /// Serving reservations and allocations.
    Active = 0,
    /// Usage is being forced toward zero; new reservations are rejected.
    Draining = 1,
    /// Capacity released and deregistered.
    Destroyed = 2,
}

impl PoolState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Draining,
            _ => Self::Destroyed,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Draining => f.write_str("draining"),
            Self::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// Options fixed at pool creation. Children inherit their parent's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Alignment of every allocation.
    pub alignment: u16,
    /// Upper bound on the root's capacity.
    pub max_capacity: u64,
    /// Whether reservations are accounted at all.
    pub track_usage: bool,
    /// Whether individual allocations are recorded.
    pub debug_enabled: bool,
    /// Panic instead of returning capacity errors.
    pub fail_on_allocation_failure: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            max_capacity: MAX_MEMORY,
            track_usage: true,
            debug_enabled: false,
            fail_on_allocation_failure: false,
        }
    }
}

impl PoolOptions {
    /// Sets the allocation alignment.
    pub fn with_alignment(mut self, alignment: u16) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the maximum capacity.
    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Enables or disables usage tracking.
    pub fn with_track_usage(mut self, enabled: bool) -> Self {
        self.track_usage = enabled;
        self
    }

    /// Enables or disables per-allocation records.
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    /// Enables or disables panicking on allocation failure.
    pub fn with_fail_on_allocation_failure(mut self, enabled: bool) -> Self {
        self.fail_on_allocation_failure = enabled;
        self
    }
}

/// Capability handed to a root pool for negotiating its capacity.
///
/// The memory manager implements this; pools never hold a reference to the
/// manager itself.
pub trait PoolGovernor: Send + Sync {
    /// Asks for `increment_bytes` more capacity on root `pool`.
    ///
    /// Returns `Ok(true)` if the pool's capacity was grown.
    fn grow_pool(&self, pool: &MemoryPool, increment_bytes: u64) -> MemoryResult<bool>;

    /// Called once from the root pool's destructor.
    fn drop_pool(&self, pool: &MemoryPool) -> MemoryResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_state_roundtrip() {
        for state in [PoolState::Active, PoolState::Draining, PoolState::Destroyed] {
            assert_eq!(PoolState::from_u8(state as u8), state);
        }
        assert!(PoolState::Active < PoolState::Draining);
        assert!(PoolState::Draining < PoolState::Destroyed);
    }

    #[test]
    fn test_pool_options_builder() {
        let options = PoolOptions::default()
            .with_alignment(64)
            .with_max_capacity(1024)
            .with_track_usage(false)
            .with_debug(true)
            .with_fail_on_allocation_failure(true);

        assert_eq!(options.alignment, 64);
        assert_eq!(options.max_capacity, 1024);
        assert!(!options.track_usage);
        assert!(options.debug_enabled);
        assert!(options.fail_on_allocation_failure);
    }

    #[test]
    fn test_display() {
        assert_eq!(PoolKind::Leaf.to_string(), "LEAF");
        assert_eq!(PoolKind::Aggregate.to_string(), "AGGREGATE");
        assert_eq!(PoolState::Draining.to_string(), "draining");
    }
}
