//! Memory reclamation contract.
//!
//! A reclaimer is attached to a pool by the consumer that owns it. The
//! arbitrator calls it when another pool needs capacity this pool is
//! holding. How the memory is actually released (spilling to disk, dropping
//! caches) is up to the consumer.

use std::sync::Arc;
use std::time::Instant;

use crate::pool::MemoryPool;

/// Shrinks a pool's live usage on request.
///
/// Implementations are invoked concurrently with ordinary allocation traffic
/// on the same pool and must do any pool-local synchronization they need.
pub trait MemoryReclaimer: Send + Sync {
    /// Returns how many bytes `pool` could release, or `None` if it cannot
    /// release anything right now.
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64>;

    /// Tries to release at least `target_bytes` from `pool` before `deadline`.
    ///
    /// A `target_bytes` of zero asks for as much as possible. Returns the
    /// number of bytes actually released, which may be zero.
    fn reclaim(&self, pool: &MemoryPool, target_bytes: u64, deadline: Instant) -> u64;
}

/// Reclaimer for aggregate pools that forwards to the children.
///
/// Children are visited in descending reclaimable order until the target is
/// met or the deadline passes. Children without a reclaimer are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeReclaimer;

impl TreeReclaimer {
    /// Creates a boxed tree reclaimer, ready to hand to a pool.
    pub fn boxed() -> Box<dyn MemoryReclaimer> {
        Box::new(Self)
    }

    fn reclaimable_children(pool: &MemoryPool) -> Vec<(Arc<MemoryPool>, u64)> {
        let mut children: Vec<_> = pool
            .children()
            .into_iter()
            .filter_map(|child| match child.reclaimable_bytes() {
                Some(bytes) if bytes > 0 => Some((child, bytes)),
                _ => None,
            })
            .collect();
        children.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name().cmp(b.0.name())));
        children
    }
}

impl MemoryReclaimer for TreeReclaimer {
    fn reclaimable_bytes(&self, pool: &MemoryPool) -> Option<u64> {
        let mut total: Option<u64> = None;
        for child in pool.children() {
            if let Some(bytes) = child.reclaimable_bytes() {
                total = Some(total.unwrap_or(0).saturating_add(bytes));
            }
        }
        total
    }

    fn reclaim(&self, pool: &MemoryPool, target_bytes: u64, deadline: Instant) -> u64 {
        let mut reclaimed = 0u64;
        for (child, _) in Self::reclaimable_children(pool) {
            if Instant::now() >= deadline {
                break;
            }
            let remaining = if target_bytes == 0 {
                0
            } else {
                target_bytes - reclaimed
            };
            reclaimed = reclaimed.saturating_add(child.reclaim(remaining, deadline));
            if target_bytes != 0 && reclaimed >= target_bytes {
                break;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::allocator::MallocAllocator;
    use crate::pool::PoolOptions;

    /// Releases reservations it made on behalf of the pool it is attached to.
    struct ReservationReclaimer {
        reserved: Arc<AtomicU64>,
    }

    impl MemoryReclaimer for ReservationReclaimer {
        fn reclaimable_bytes(&self, _pool: &MemoryPool) -> Option<u64> {
            Some(self.reserved.load(Ordering::SeqCst))
        }

        fn reclaim(&self, pool: &MemoryPool, target_bytes: u64, _deadline: Instant) -> u64 {
            let held = self.reserved.load(Ordering::SeqCst);
            let bytes = if target_bytes == 0 { held } else { held.min(target_bytes) };
            self.reserved.fetch_sub(bytes, Ordering::SeqCst);
            pool.release(bytes);
            bytes
        }
    }

    fn root() -> Arc<MemoryPool> {
        let root = MemoryPool::new_root(
            "root",
            PoolOptions::default().with_max_capacity(4096),
            Arc::new(MallocAllocator::unlimited()),
            None,
            Some(TreeReclaimer::boxed()),
        );
        root.grow(4096).unwrap();
        root
    }

    fn reclaimable_leaf(
        root: &Arc<MemoryPool>,
        name: &str,
        bytes: u64,
    ) -> (Arc<MemoryPool>, Arc<AtomicU64>) {
        let reserved = Arc::new(AtomicU64::new(0));
        let leaf = root
            .add_leaf_child(
                name,
                true,
                Some(Box::new(ReservationReclaimer {
                    reserved: Arc::clone(&reserved),
                })),
            )
            .unwrap();
        leaf.reserve(bytes).unwrap();
        reserved.store(bytes, Ordering::SeqCst);
        (leaf, reserved)
    }

    #[test]
    fn test_tree_reclaimable_bytes() {
        let root = root();
        assert_eq!(root.reclaimable_bytes(), None);

        let (a, _) = reclaimable_leaf(&root, "a", 1024);
        let (b, _) = reclaimable_leaf(&root, "b", 512);
        let _plain = root.add_leaf_child("plain", true, None).unwrap();

        assert_eq!(root.reclaimable_bytes(), Some(1536));

        a.release(1024);
        b.release(512);
    }

    #[test]
    fn test_tree_reclaim_largest_child_first() {
        let root = root();
        let (a, _) = reclaimable_leaf(&root, "a", 512);
        let (b, _) = reclaimable_leaf(&root, "b", 1024);

        let deadline = Instant::now() + Duration::from_secs(5);
        let reclaimed = root.reclaim(1000, deadline);

        assert_eq!(reclaimed, 1000);
        assert_eq!(b.used_bytes(), 24);
        assert_eq!(a.used_bytes(), 512);
        assert_eq!(root.used_bytes(), 536);

        b.release(24);
        a.release(512);
    }

    #[test]
    fn test_tree_reclaim_everything() {
        let root = root();
        let (a, _) = reclaimable_leaf(&root, "a", 512);
        let (b, _) = reclaimable_leaf(&root, "b", 1024);

        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(root.reclaim(0, deadline), 1536);
        assert_eq!(a.used_bytes(), 0);
        assert_eq!(b.used_bytes(), 0);
        assert_eq!(root.used_bytes(), 0);
    }

    #[test]
    fn test_tree_reclaim_respects_deadline() {
        let root = root();
        let (a, _) = reclaimable_leaf(&root, "a", 512);

        let expired = Instant::now() - Duration::from_millis(1);
        assert_eq!(root.reclaim(0, expired), 0);
        assert_eq!(a.used_bytes(), 512);

        a.release(512);
    }
}
