//! Integration tests for pool creation, arbitration and teardown through the
//! memory manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nexus_common::constants::{MAX_MEMORY, TB};
use nexus_memory::{
    ArbitratorKind, MemoryError, MemoryManager, MemoryManagerOptions, MemoryPool, MemoryReclaimer,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Routes pool and arbitrator logs to the test output, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .without_time()
        .try_init();
}

/// Options for a small manager with a 1000-byte budget.
fn small_options(init_capacity: u64) -> MemoryManagerOptions {
    MemoryManagerOptions::with_capacity(1000)
        .with_init_capacity(init_capacity)
        .with_transfer_capacity(0)
        .with_reclaim_wait_ms(5_000)
        .with_num_shared_leaf_pools(1)
}

/// Spills one leaf's reservation when asked.
struct SpillingReclaimer {
    leaf: Arc<Mutex<Option<Arc<MemoryPool>>>>,
    reserved: Arc<AtomicU64>,
}

impl MemoryReclaimer for SpillingReclaimer {
    fn reclaimable_bytes(&self, _pool: &MemoryPool) -> Option<u64> {
        Some(self.reserved.load(Ordering::SeqCst))
    }

    fn reclaim(&self, _pool: &MemoryPool, target_bytes: u64, _deadline: Instant) -> u64 {
        let Some(leaf) = self.leaf.lock().clone() else {
            return 0;
        };
        let held = self.reserved.load(Ordering::SeqCst);
        let bytes = if target_bytes == 0 { held } else { held.min(target_bytes) };
        self.reserved.fetch_sub(bytes, Ordering::SeqCst);
        leaf.release(bytes);
        bytes
    }
}

#[test]
fn test_add_root_pool_grants_initial_capacity() {
    let manager = MemoryManager::new(small_options(300)).unwrap();

    let q1 = manager.add_root_pool("q1", 500, None).unwrap();
    assert_eq!(q1.capacity(), 300);
    assert_eq!(q1.max_capacity(), 500);
    assert_eq!(manager.num_pools(), 1);

    let err = manager.add_root_pool("q1", 500, None).unwrap_err();
    assert!(matches!(err, MemoryError::DuplicatePool { ref name } if name == "q1"));
    assert_eq!(manager.num_pools(), 1);
}

#[test]
fn test_initial_capacity_capped_by_max_capacity() {
    let manager = MemoryManager::new(small_options(800)).unwrap();
    let q1 = manager.add_root_pool("q1", 500, None).unwrap();
    assert_eq!(q1.capacity(), 500);

    // Only what is left in the budget.
    let q2 = manager.add_root_pool("q2", 1000, None).unwrap();
    assert_eq!(q2.capacity(), 500);
}

#[test]
fn test_growth_reclaims_from_other_pool() {
    init_tracing();
    let manager = MemoryManager::new(small_options(0)).unwrap();

    let slot = Arc::new(Mutex::new(None));
    let reserved = Arc::new(AtomicU64::new(0));
    let a = manager
        .add_root_pool(
            "a",
            600,
            Some(Box::new(SpillingReclaimer {
                leaf: Arc::clone(&slot),
                reserved: Arc::clone(&reserved),
            })),
        )
        .unwrap();
    let b = manager.add_root_pool("b", 600, None).unwrap();

    let a_leaf = a.add_leaf_child("a.scan", true, None).unwrap();
    a_leaf.reserve(600).unwrap();
    reserved.store(600, Ordering::SeqCst);
    *slot.lock() = Some(Arc::clone(&a_leaf));
    assert_eq!(a.capacity(), 600);

    let b_leaf = b.add_leaf_child("b.scan", true, None).unwrap();
    b_leaf.reserve(500).unwrap();

    assert_eq!(b.capacity(), 500);
    assert_eq!(b.used_bytes(), 500);
    assert_eq!(a.capacity(), 500);
    assert_eq!(a_leaf.used_bytes(), 500);
    assert!(a.capacity() + b.capacity() <= manager.capacity());
    assert!(manager.arbitrator().stats().num_reclaimed_bytes >= 100);

    slot.lock().take();
    a_leaf.release(500);
    b_leaf.release(500);
}

#[test]
fn test_growth_fails_without_reclaimer() {
    init_tracing();
    let manager = MemoryManager::new(small_options(0)).unwrap();
    let a = manager.add_root_pool("a", 600, None).unwrap();
    let b = manager.add_root_pool("b", 600, None).unwrap();

    let a_leaf = a.add_leaf_child("a.scan", true, None).unwrap();
    a_leaf.reserve(600).unwrap();

    let b_leaf = b.add_leaf_child("b.scan", true, None).unwrap();
    let err = b_leaf.reserve(500).unwrap_err();
    assert!(err.is_capacity_exhausted());
    assert!(matches!(err, MemoryError::CapacityExceeded { ref pool, requested: 500, .. } if pool == "b.scan"));
    assert_eq!(b.used_bytes(), 0);
    assert_eq!(a.capacity(), 600);
    assert!(!b_leaf.maybe_reserve(500));

    // Whatever is left still fits.
    b_leaf.reserve(400).unwrap();
    assert_eq!(a.capacity() + b.capacity(), 1000);

    a_leaf.release(600);
    b_leaf.release(400);
}

#[test]
fn test_noop_arbitrator_stays_within_budget() {
    init_tracing();
    let options = MemoryManagerOptions::from_toml_str("capacity = 1000").unwrap();
    let manager = MemoryManager::new(options).unwrap();
    assert_eq!(manager.arbitrator().kind(), ArbitratorKind::Noop);
    assert_eq!(manager.arbitrator().capacity(), 1000);

    let a = manager.add_root_pool("a", 600, None).unwrap();
    let b = manager.add_root_pool("b", 600, None).unwrap();
    assert_eq!(a.capacity(), 600);
    assert_eq!(b.capacity(), 400);
    assert_eq!(manager.arbitrator().stats().free_capacity, 0);

    let b_leaf = b.add_leaf_child("b.scan", true, None).unwrap();
    let err = b_leaf.reserve(500).unwrap_err();
    assert!(err.is_capacity_exhausted());
    assert_eq!(b.capacity(), 400);
    b_leaf.reserve(400).unwrap();
    assert!(a.capacity() + b.capacity() <= manager.capacity());

    b_leaf.release(400);
    drop(b_leaf);
    drop(a);
    drop(b);
    assert_eq!(manager.arbitrator().stats().free_capacity, 1000);
}

#[test]
fn test_default_root_ignores_budget() {
    let manager = MemoryManager::new(small_options(0).with_track_default_usage(true)).unwrap();
    let root = manager.default_root();
    assert_eq!(root.capacity(), MAX_MEMORY);

    let leaf = manager.add_leaf_pool("system", true).unwrap();
    leaf.reserve(TB).unwrap();
    assert_eq!(root.used_bytes(), TB);

    let stats = manager.arbitrator().stats();
    assert_eq!(stats.num_requests, 0);
    assert_eq!(stats.free_capacity, 1000);
    assert!(matches!(
        manager.grow_pool(root, 1),
        Err(MemoryError::InvalidOperation { .. })
    ));

    leaf.release(TB);
}

#[test]
fn test_shrink_pools_frees_unused_capacity() {
    init_tracing();
    let manager = MemoryManager::new(small_options(1000)).unwrap();
    let a = manager.add_root_pool("a", 200, None).unwrap();
    let b = manager.add_root_pool("b", 300, None).unwrap();
    let c = manager.add_root_pool("c", 400, None).unwrap();
    let arbitrator = Arc::clone(manager.arbitrator());
    assert_eq!(arbitrator.stats().free_capacity, 100);

    assert_eq!(manager.shrink_pools(300), 300);
    assert_eq!(arbitrator.stats().free_capacity, 400);
    // Largest holder first.
    assert_eq!(c.capacity(), 100);
    assert_eq!(b.capacity(), 300);
    assert_eq!(a.capacity(), 200);

    assert_eq!(manager.shrink_pools(0), 600);
    assert_eq!(arbitrator.stats().free_capacity, 1000);
    assert_eq!(a.capacity() + b.capacity() + c.capacity(), 0);
}

#[test]
fn test_dropped_pools_leave_ledger_whole() {
    let manager = MemoryManager::new(small_options(250)).unwrap();
    let pools: Vec<_> = (0..4)
        .map(|i| manager.add_root_pool(&format!("q{i}"), 1000, None).unwrap())
        .collect();
    assert_eq!(manager.arbitrator().stats().free_capacity, 0);
    assert_eq!(manager.alive_pools().len(), 4);

    drop(pools);
    assert_eq!(manager.num_pools(), 0);
    assert_eq!(manager.arbitrator().stats().free_capacity, 1000);
}

#[test]
#[should_panic(expected = "q1")]
fn test_manager_drop_reports_leaked_pool() {
    let manager = MemoryManager::new(small_options(0).with_check_usage_leak(true)).unwrap();
    let _q1 = manager.add_root_pool("q1", 500, None).unwrap();
    drop(manager);
}

#[test]
fn test_manager_drop_without_leak_check() {
    let manager = MemoryManager::new(small_options(0).with_check_usage_leak(false)).unwrap();
    let q1 = manager.add_root_pool("q1", 500, None).unwrap();
    drop(manager);
    assert_eq!(q1.name(), "q1");
}
