//! Arbitrator with a shared capacity ledger and reclamation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_common::units::succinct_bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::policy::{Candidate, ReclaimPolicy};
use super::{ArbitratorConfig, ArbitratorKind, ArbitratorStats, MemoryArbitrator};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::MemoryPool;

#[derive(Debug, Default)]
struct Counters {
    num_requests: AtomicU64,
    num_succeeded: AtomicU64,
    num_failures: AtomicU64,
    num_timeouts: AtomicU64,
    num_shrunk_bytes: AtomicU64,
    num_reclaimed_bytes: AtomicU64,
    queue_time_us: AtomicU64,
    arbitration_time_us: AtomicU64,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Arbitrator that moves capacity between root pools.
///
/// Growth requests are served in three phases, stopping as soon as the free
/// ledger covers the request:
///
/// 1. Take from the free ledger.
/// 2. Take unused capacity from other pools.
/// 3. Ask other pools' reclaimers to release live usage, then take the
///    capacity that freed up.
///
/// Requests are serialized by a timed lock. A request that cannot acquire it
/// within the reclaim wait fails. Capacity taken back during a failed request
/// stays in the free ledger.
pub struct SharedArbitrator {
    capacity: u64,
    transfer_capacity: u64,
    reclaim_wait: Duration,
    policy: Box<dyn ReclaimPolicy>,
    /// Capacity not granted to any pool. Never held across pool calls.
    free_capacity: Mutex<u64>,
    /// Serializes growth and shrink requests.
    arbitration: Mutex<()>,
    counters: Counters,
}

impl SharedArbitrator {
    /// Creates the arbitrator with the configured policy.
    #[must_use]
    pub fn new(config: &ArbitratorConfig) -> Self {
        Self::with_policy(config, config.reclaim_policy.build())
    }

    /// Creates the arbitrator with a caller-provided policy.
    #[must_use]
    pub fn with_policy(config: &ArbitratorConfig, policy: Box<dyn ReclaimPolicy>) -> Self {
        info!(
            capacity = %succinct_bytes(config.capacity),
            transfer_capacity = %succinct_bytes(config.memory_pool_transfer_capacity),
            reclaim_wait_ms = config.reclaim_wait.as_millis(),
            policy = policy.name(),
            "created shared memory arbitrator"
        );
        Self {
            capacity: config.capacity,
            transfer_capacity: config.memory_pool_transfer_capacity,
            reclaim_wait: config.reclaim_wait,
            policy,
            free_capacity: Mutex::new(config.capacity),
            arbitration: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Returns the capacity not granted to any pool.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        *self.free_capacity.lock()
    }

    /// Takes up to `max_bytes` from the ledger if at least `min_bytes` are free.
    fn take_free(&self, min_bytes: u64, max_bytes: u64) -> u64 {
        let mut free = self.free_capacity.lock();
        if *free < min_bytes {
            return 0;
        }
        let taken = (*free).min(max_bytes);
        *free -= taken;
        taken
    }

    fn return_free(&self, bytes: u64) -> MemoryResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut free = self.free_capacity.lock();
        let total = free
            .checked_add(bytes)
            .filter(|total| *total <= self.capacity)
            .ok_or_else(|| {
                MemoryError::inconsistent(format!(
                    "returning {} to the arbitrator ledger with {} free exceeds its capacity {}",
                    succinct_bytes(bytes),
                    succinct_bytes(*free),
                    succinct_bytes(self.capacity)
                ))
            })?;
        *free = total;
        Ok(())
    }

    fn free_shortfall(&self, target_bytes: u64) -> u64 {
        target_bytes.saturating_sub(self.free_capacity())
    }

    /// Grows `pool` by `bytes` taken from the ledger, or puts them back.
    fn grant(&self, pool: &MemoryPool, bytes: u64) -> MemoryResult<()> {
        if let Err(error) = pool.grow(bytes) {
            self.return_free(bytes)?;
            return Err(error);
        }
        Ok(())
    }

    /// Shrinks `pool` and credits the freed capacity to the ledger.
    fn take_back(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        let freed = pool.shrink(target_bytes);
        if let Err(error) = self.return_free(freed) {
            // Keep the bytes on the pool so they stay accounted for.
            warn!(pool = pool.name(), %error, "failed to return shrunk capacity");
            if let Err(grow_error) = pool.grow(freed) {
                error!(
                    pool = pool.name(),
                    %grow_error,
                    lost = %succinct_bytes(freed),
                    "capacity lost while restoring shrunk memory pool"
                );
            }
            return 0;
        }
        self.counters
            .num_shrunk_bytes
            .fetch_add(freed, Ordering::Relaxed);
        freed
    }

    fn candidates(requestor: Option<&MemoryPool>, pools: &[Arc<MemoryPool>]) -> Vec<Candidate> {
        pools
            .iter()
            .filter(|pool| {
                requestor.map_or(true, |requestor| !std::ptr::eq(Arc::as_ptr(pool), requestor))
            })
            .map(|pool| Candidate::sample(Arc::clone(pool)))
            .collect()
    }

    /// Brings the free ledger up to `target_bytes` by taking other pools'
    /// unused capacity, or all of it when the target is zero.
    fn reclaim_unused(&self, candidates: &mut [Candidate], target_bytes: u64) -> u64 {
        self.policy.order_unused(candidates);
        let mut freed = 0u64;
        for candidate in candidates.iter() {
            let remaining = if target_bytes == 0 {
                0
            } else {
                match target_bytes.saturating_sub(freed) {
                    0 => break,
                    remaining => remaining,
                }
            };
            if candidate.pool.free_capacity() == 0 {
                continue;
            }
            freed += self.take_back(&candidate.pool, remaining);
        }
        freed
    }

    /// Reclaims live usage from `candidates` and takes back the capacity it
    /// frees, until `target_bytes` are freed or the deadline passes.
    fn reclaim_used(&self, candidates: &mut [Candidate], target_bytes: u64, deadline: Instant) -> u64 {
        for candidate in candidates.iter_mut() {
            candidate.reclaimable_bytes = candidate.pool.reclaimable_bytes().unwrap_or(0);
        }
        self.policy.order_used(candidates);

        let mut freed = 0u64;
        for candidate in candidates.iter() {
            if candidate.reclaimable_bytes == 0 {
                continue;
            }
            if Instant::now() >= deadline {
                warn!(pool = candidate.pool.name(), "memory reclamation deadline passed");
                break;
            }
            let remaining = if target_bytes == 0 {
                0
            } else {
                match target_bytes.saturating_sub(freed) {
                    0 => break,
                    remaining => remaining,
                }
            };
            let reclaimed = candidate.pool.reclaim(remaining, deadline);
            self.counters
                .num_reclaimed_bytes
                .fetch_add(reclaimed, Ordering::Relaxed);
            freed += self.take_back(&candidate.pool, remaining);
        }
        freed
    }

    fn arbitrate(
        &self,
        pool: &MemoryPool,
        candidates: &[Arc<MemoryPool>],
        increment_bytes: u64,
        deadline: Instant,
    ) -> MemoryResult<bool> {
        let headroom = pool.max_capacity().saturating_sub(pool.capacity());
        if increment_bytes > headroom {
            debug!(
                pool = pool.name(),
                increment = %succinct_bytes(increment_bytes),
                headroom = %succinct_bytes(headroom),
                "growth beyond max capacity denied"
            );
            return Ok(false);
        }
        let target = increment_bytes.max(self.transfer_capacity).min(headroom);

        let mut others = Self::candidates(Some(pool), candidates);
        if self.free_shortfall(target) > 0 {
            let freed = self.reclaim_unused(&mut others, self.free_shortfall(target));
            debug!(pool = pool.name(), freed, "took back unused capacity");
        }
        if self.free_shortfall(increment_bytes) > 0 {
            let freed =
                self.reclaim_used(&mut others, self.free_shortfall(increment_bytes), deadline);
            debug!(pool = pool.name(), freed, "reclaimed used capacity");
        }

        let granted = self.take_free(increment_bytes, target);
        if granted == 0 {
            return Ok(false);
        }
        self.grant(pool, granted)?;
        debug!(
            pool = pool.name(),
            granted = %succinct_bytes(granted),
            capacity = %succinct_bytes(pool.capacity()),
            "memory pool growth granted"
        );
        Ok(true)
    }
}

impl MemoryArbitrator for SharedArbitrator {
    fn kind(&self) -> ArbitratorKind {
        ArbitratorKind::Shared
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn grant_initial_capacity(&self, pool: &MemoryPool, bytes: u64) -> MemoryResult<u64> {
        let wanted = bytes.min(pool.max_capacity().saturating_sub(pool.capacity()));
        let granted = self.take_free(0, wanted);
        if granted > 0 {
            self.grant(pool, granted)?;
        }
        debug!(pool = pool.name(), granted = %succinct_bytes(granted), "granted initial capacity");
        Ok(granted)
    }

    fn grow_capacity(
        &self,
        pool: &MemoryPool,
        candidates: &[Arc<MemoryPool>],
        increment_bytes: u64,
    ) -> MemoryResult<bool> {
        self.counters.num_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        // Lock wait and reclamation share one bound.
        let deadline = start + self.reclaim_wait;

        let Some(_guard) = self.arbitration.try_lock_until(deadline) else {
            self.counters.num_timeouts.fetch_add(1, Ordering::Relaxed);
            self.counters.num_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                pool = pool.name(),
                wait_ms = self.reclaim_wait.as_millis(),
                "timed out waiting for memory arbitration"
            );
            return Ok(false);
        };
        let queued = start.elapsed();
        self.counters
            .queue_time_us
            .fetch_add(micros(queued), Ordering::Relaxed);

        let result = self.arbitrate(pool, candidates, increment_bytes, deadline);
        self.counters
            .arbitration_time_us
            .fetch_add(micros(start.elapsed() - queued), Ordering::Relaxed);

        match result {
            Ok(true) => {
                self.counters.num_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.counters.num_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = pool.name(),
                    increment = %succinct_bytes(increment_bytes),
                    free = %succinct_bytes(self.free_capacity()),
                    "memory pool growth denied"
                );
            }
            Err(_) => {
                self.counters.num_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        self.take_back(pool, target_bytes)
    }

    fn shrink_pools(&self, pools: &[Arc<MemoryPool>], target_bytes: u64) -> u64 {
        let deadline = Instant::now() + self.reclaim_wait;
        let Some(_guard) = self.arbitration.try_lock_until(deadline) else {
            self.counters.num_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!("timed out waiting for memory arbitration to shrink pools");
            return 0;
        };

        let mut candidates = Self::candidates(None, pools);
        let mut freed = self.reclaim_unused(&mut candidates, target_bytes);
        if target_bytes == 0 || freed < target_bytes {
            let remaining = if target_bytes == 0 {
                0
            } else {
                target_bytes - freed
            };
            freed += self.reclaim_used(&mut candidates, remaining, deadline);
        }
        debug!(
            target = %succinct_bytes(target_bytes),
            freed = %succinct_bytes(freed),
            "shrunk memory pools"
        );
        freed
    }

    fn stats(&self) -> ArbitratorStats {
        let counters = &self.counters;
        ArbitratorStats {
            num_requests: counters.num_requests.load(Ordering::Relaxed),
            num_succeeded: counters.num_succeeded.load(Ordering::Relaxed),
            num_failures: counters.num_failures.load(Ordering::Relaxed),
            num_timeouts: counters.num_timeouts.load(Ordering::Relaxed),
            num_shrunk_bytes: counters.num_shrunk_bytes.load(Ordering::Relaxed),
            num_reclaimed_bytes: counters.num_reclaimed_bytes.load(Ordering::Relaxed),
            queue_time_us: counters.queue_time_us.load(Ordering::Relaxed),
            arbitration_time_us: counters.arbitration_time_us.load(Ordering::Relaxed),
            capacity: self.capacity,
            free_capacity: self.free_capacity(),
        }
    }
}
