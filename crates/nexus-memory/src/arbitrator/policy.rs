//! Candidate ordering for reclamation.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::pool::MemoryPool;

/// A pool considered for reclamation, with its numbers sampled once per
/// arbitration round.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The root pool.
    pub pool: Arc<MemoryPool>,
    /// Unused capacity at sampling time.
    pub free_capacity: u64,
    /// Reclaimable bytes reported by the pool's reclaimer, zero without one.
    pub reclaimable_bytes: u64,
    /// Activity tick at sampling time.
    pub last_active: u64,
}

impl Candidate {
    /// Samples `pool`.
    #[must_use]
    pub fn sample(pool: Arc<MemoryPool>) -> Self {
        Self {
            free_capacity: pool.free_capacity(),
            reclaimable_bytes: pool.reclaimable_bytes().unwrap_or(0),
            last_active: pool.last_active(),
            pool,
        }
    }

    fn by_name(&self, other: &Self) -> Ordering {
        self.pool.name().cmp(other.pool.name())
    }
}

/// Decides which pools give up memory first.
pub trait ReclaimPolicy: Send + Sync {
    /// Policy name used in dumps.
    fn name(&self) -> &'static str;

    /// Orders candidates for giving back unused capacity.
    fn order_unused(&self, candidates: &mut [Candidate]);

    /// Orders candidates for reclaiming live usage.
    fn order_used(&self, candidates: &mut [Candidate]);
}

/// Takes from the pools holding the most.
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirstPolicy;

impl ReclaimPolicy for LargestFirstPolicy {
    fn name(&self) -> &'static str {
        "LARGEST_FIRST"
    }

    fn order_unused(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            b.free_capacity
                .cmp(&a.free_capacity)
                .then_with(|| a.by_name(b))
        });
    }

    fn order_used(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            b.reclaimable_bytes
                .cmp(&a.reclaimable_bytes)
                .then_with(|| a.by_name(b))
        });
    }
}

/// Takes from the pools idle the longest.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsedPolicy;

impl LeastRecentlyUsedPolicy {
    fn order(candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| a.last_active.cmp(&b.last_active).then_with(|| a.by_name(b)));
    }
}

impl ReclaimPolicy for LeastRecentlyUsedPolicy {
    fn name(&self) -> &'static str {
        "LEAST_RECENTLY_USED"
    }

    fn order_unused(&self, candidates: &mut [Candidate]) {
        Self::order(candidates);
    }

    fn order_used(&self, candidates: &mut [Candidate]) {
        Self::order(candidates);
    }
}
