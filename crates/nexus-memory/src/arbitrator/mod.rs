//! Memory arbitration.
//!
//! An arbitrator owns the capacity ledger shared by all root pools and
//! decides whether a pool may grow, possibly at the expense of others.
//!
//! # Kinds
//!
//! - [`NoopArbitrator`]: grants every pool its max capacity at creation, as
//!   far as the budget allows, and denies all later growth.
//! - [`SharedArbitrator`]: keeps a free-capacity ledger and satisfies growth
//!   from it, then from other pools' unused capacity, then by reclaiming other
//!   pools' live memory.

mod noop;
mod policy;
mod shared;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nexus_common::constants::{
    DEFAULT_POOL_INIT_CAPACITY, DEFAULT_POOL_TRANSFER_CAPACITY, DEFAULT_RECLAIM_WAIT_MS, MAX_MEMORY,
};
use nexus_common::units::succinct_bytes;
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;
use crate::pool::MemoryPool;

pub use noop::NoopArbitrator;
pub use policy::{Candidate, LargestFirstPolicy, LeastRecentlyUsedPolicy, ReclaimPolicy};
pub use shared::SharedArbitrator;

/// Arbitrator implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitratorKind {
    /// Up-front grants only; growth is denied.
    #[default]
    Noop,
    /// Shared ledger with reclamation.
    Shared,
}

impl fmt::Display for ArbitratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("NOOP"),
            Self::Shared => f.write_str("SHARED"),
        }
    }
}

/// Built-in candidate orderings for reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicyKind {
    /// Pools holding the most first.
    #[default]
    LargestFirst,
    /// Pools idle the longest first.
    LeastRecentlyUsed,
}

impl ReclaimPolicyKind {
    /// Builds the policy.
    #[must_use]
    pub fn build(self) -> Box<dyn ReclaimPolicy> {
        match self {
            Self::LargestFirst => Box::new(LargestFirstPolicy),
            Self::LeastRecentlyUsed => Box::new(LeastRecentlyUsedPolicy),
        }
    }
}

/// Arbitrator construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitratorConfig {
    /// Which implementation to build.
    pub kind: ArbitratorKind,
    /// Total arbitratable capacity.
    pub capacity: u64,
    /// Capacity granted to a root pool at creation.
    pub memory_pool_init_capacity: u64,
    /// Minimum capacity moved per growth request.
    pub memory_pool_transfer_capacity: u64,
    /// Bound on arbitration waits and on each reclamation round.
    pub reclaim_wait: Duration,
    /// Candidate ordering for the shared arbitrator.
    pub reclaim_policy: ReclaimPolicyKind,
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            kind: ArbitratorKind::default(),
            capacity: MAX_MEMORY,
            memory_pool_init_capacity: DEFAULT_POOL_INIT_CAPACITY,
            memory_pool_transfer_capacity: DEFAULT_POOL_TRANSFER_CAPACITY,
            reclaim_wait: Duration::from_millis(DEFAULT_RECLAIM_WAIT_MS),
            reclaim_policy: ReclaimPolicyKind::default(),
        }
    }
}

/// Arbitration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbitratorStats {
    /// Growth requests received.
    pub num_requests: u64,
    /// Growth requests granted.
    pub num_succeeded: u64,
    /// Growth requests denied, timeouts included.
    pub num_failures: u64,
    /// Requests that gave up waiting for the arbitration lock.
    pub num_timeouts: u64,
    /// Unused capacity taken back from pools.
    pub num_shrunk_bytes: u64,
    /// Live usage released by reclaimers.
    pub num_reclaimed_bytes: u64,
    /// Total time spent waiting for the arbitration lock.
    pub queue_time_us: u64,
    /// Total time spent arbitrating.
    pub arbitration_time_us: u64,
    /// Arbitratable capacity.
    pub capacity: u64,
    /// Capacity not granted to any pool.
    pub free_capacity: u64,
}

impl fmt::Display for ArbitratorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATS[numRequests {} numSucceeded {} numFailures {} numTimeouts {} \
             queueTime {}us arbitrationTime {}us shrunkBytes {} reclaimedBytes {} \
             capacity {} freeCapacity {}]",
            self.num_requests,
            self.num_succeeded,
            self.num_failures,
            self.num_timeouts,
            self.queue_time_us,
            self.arbitration_time_us,
            succinct_bytes(self.num_shrunk_bytes),
            succinct_bytes(self.num_reclaimed_bytes),
            succinct_bytes(self.capacity),
            succinct_bytes(self.free_capacity),
        )
    }
}

/// Policy object governing capacity across root pools.
///
/// All methods are called concurrently from many threads. Pools passed in
/// are root pools.
pub trait MemoryArbitrator: Send + Sync {
    /// Returns the implementation kind.
    fn kind(&self) -> ArbitratorKind;

    /// Returns the arbitratable capacity.
    fn capacity(&self) -> u64;

    /// Grants a newly created pool its starting capacity, at most `bytes`.
    ///
    /// Returns the bytes granted, which may be less than requested.
    fn grant_initial_capacity(&self, pool: &MemoryPool, bytes: u64) -> MemoryResult<u64>;

    /// Grows `pool` by at least `increment_bytes`.
    ///
    /// `candidates` is every live root pool and may include `pool` itself,
    /// which is never reclaimed from. Returns `Ok(false)` if the growth was
    /// denied, in which case the pool's capacity is unchanged.
    fn grow_capacity(
        &self,
        pool: &MemoryPool,
        candidates: &[Arc<MemoryPool>],
        increment_bytes: u64,
    ) -> MemoryResult<bool>;

    /// Returns up to `target_bytes` of `pool`'s unused capacity to the ledger,
    /// or all of it when zero. Returns the bytes returned.
    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64;

    /// Frees up to `target_bytes` across `pools`, or as much as possible when
    /// zero, reclaiming live usage if unused capacity is not enough. Returns
    /// the bytes returned to the ledger.
    fn shrink_pools(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> u64;

    /// Returns a snapshot of the counters.
    fn stats(&self) -> ArbitratorStats;

    /// One-line description for manager dumps.
    fn describe(&self) -> String {
        format!(
            "ARBITRATOR[{} CAPACITY {}] {}",
            self.kind(),
            succinct_bytes(self.capacity()),
            self.stats()
        )
    }
}

/// Builds the arbitrator described by `config`.
#[must_use]
pub fn create_arbitrator(config: &ArbitratorConfig) -> Arc<dyn MemoryArbitrator> {
    match config.kind {
        ArbitratorKind::Noop => Arc::new(NoopArbitrator::new(config)),
        ArbitratorKind::Shared => Arc::new(SharedArbitrator::new(config)),
    }
}
