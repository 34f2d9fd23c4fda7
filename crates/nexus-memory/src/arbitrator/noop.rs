//! Arbitrator without growth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nexus_common::units::succinct_bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{ArbitratorConfig, ArbitratorKind, ArbitratorStats, MemoryArbitrator};
use crate::error::{MemoryError, MemoryResult};
use crate::pool::MemoryPool;

/// Grants each pool as much of its max capacity as the budget allows at
/// creation and denies later growth.
///
/// Grants come from a free ledger, so their sum never exceeds the
/// arbitrator's capacity. With an unlimited capacity every pool gets its full
/// max capacity. Capacity comes back only when a pool is shrunk or dropped.
#[derive(Debug)]
pub struct NoopArbitrator {
    capacity: u64,
    /// Capacity not granted to any pool.
    free_capacity: Mutex<u64>,
    num_requests: AtomicU64,
}

impl NoopArbitrator {
    /// Creates the arbitrator.
    #[must_use]
    pub fn new(config: &ArbitratorConfig) -> Self {
        info!(capacity = %succinct_bytes(config.capacity), "created noop memory arbitrator");
        Self {
            capacity: config.capacity,
            free_capacity: Mutex::new(config.capacity),
            num_requests: AtomicU64::new(0),
        }
    }

    /// Returns the capacity not granted to any pool.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        *self.free_capacity.lock()
    }

    fn return_free(&self, bytes: u64) -> MemoryResult<()> {
        let mut free = self.free_capacity.lock();
        let total = free
            .checked_add(bytes)
            .filter(|total| *total <= self.capacity)
            .ok_or_else(|| {
                MemoryError::inconsistent(format!(
                    "returning {} to the noop arbitrator with {} free exceeds its capacity {}",
                    succinct_bytes(bytes),
                    succinct_bytes(*free),
                    succinct_bytes(self.capacity)
                ))
            })?;
        *free = total;
        Ok(())
    }
}

impl MemoryArbitrator for NoopArbitrator {
    fn kind(&self) -> ArbitratorKind {
        ArbitratorKind::Noop
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn grant_initial_capacity(&self, pool: &MemoryPool, _bytes: u64) -> MemoryResult<u64> {
        let headroom = pool.max_capacity().saturating_sub(pool.capacity());
        let grant = {
            let mut free = self.free_capacity.lock();
            let grant = headroom.min(*free);
            *free -= grant;
            grant
        };
        if grant == 0 {
            return Ok(0);
        }
        if let Err(error) = pool.grow(grant) {
            self.return_free(grant)?;
            return Err(error);
        }
        Ok(grant)
    }

    fn grow_capacity(
        &self,
        pool: &MemoryPool,
        _candidates: &[Arc<MemoryPool>],
        increment_bytes: u64,
    ) -> MemoryResult<bool> {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
        debug!(pool = pool.name(), increment_bytes, "noop arbitrator denies growth");
        Ok(false)
    }

    fn shrink_pool(&self, pool: &MemoryPool, target_bytes: u64) -> u64 {
        let freed = pool.shrink(target_bytes);
        if freed == 0 {
            return 0;
        }
        if let Err(error) = self.return_free(freed) {
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
        freed
    }

    fn shrink_pools(&self, _pools: &[Arc<MemoryPool>], _target_bytes: u64) -> u64 {
        0
    }

    fn stats(&self) -> ArbitratorStats {
        let num_requests = self.num_requests.load(Ordering::Relaxed);
        ArbitratorStats {
            num_requests,
            num_failures: num_requests,
            capacity: self.capacity,
            free_capacity: self.free_capacity(),
            ..ArbitratorStats::default()
        }
    }
}
