//! Capacity conservation under concurrent reservation traffic.

use std::sync::Arc;
use std::thread;

use nexus_common::constants::KB;
use nexus_memory::{MemoryManager, MemoryManagerOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAPACITY: u64 = 256 * KB;
const NUM_THREADS: usize = 8;
const OPS_PER_THREAD: usize = 2_000;

fn manager() -> MemoryManager {
    MemoryManager::new(
        MemoryManagerOptions::with_capacity(CAPACITY)
            .with_init_capacity(0)
            .with_transfer_capacity(4 * KB)
            .with_reclaim_wait_ms(10_000)
            .with_num_shared_leaf_pools(2),
    )
    .unwrap()
}

fn assert_conserved(manager: &MemoryManager) {
    let granted: u64 = manager.alive_pools().iter().map(|pool| pool.capacity()).sum();
    let free = manager.arbitrator().stats().free_capacity;
    assert!(granted + free <= CAPACITY, "granted {granted} + free {free} exceeds {CAPACITY}");
}

#[test]
fn test_concurrent_growth_conserves_capacity() {
    let manager = Arc::new(manager());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(i as u64);
                let root = manager
                    .add_root_pool(&format!("query-{i}"), CAPACITY / 2, None)
                    .unwrap();
                let leaf = root.add_leaf_child("operator", true, None).unwrap();
                let mut held = Vec::new();

                for _ in 0..OPS_PER_THREAD {
                    if held.is_empty() || rng.gen_bool(0.6) {
                        let bytes = rng.gen_range(1..=8 * KB);
                        if leaf.maybe_reserve(bytes) {
                            held.push(bytes);
                        }
                    } else {
                        let index = rng.gen_range(0..held.len());
                        leaf.release(held.swap_remove(index));
                    }
                    assert!(root.used_bytes() <= root.capacity());
                    assert!(root.capacity() <= root.max_capacity());
                }

                for bytes in held {
                    leaf.release(bytes);
                }
                assert_eq!(root.used_bytes(), 0);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manager.num_pools(), 0);
    assert_eq!(manager.arbitrator().stats().free_capacity, CAPACITY);
}

#[test]
fn test_concurrent_allocation_and_shrink() {
    let manager = Arc::new(manager());
    let roots: Vec<_> = (0..4)
        .map(|i| manager.add_root_pool(&format!("q{i}"), CAPACITY, None).unwrap())
        .collect();

    let workers: Vec<_> = roots
        .iter()
        .enumerate()
        .map(|(i, root)| {
            let leaf = root.add_leaf_child(format!("leaf-{i}"), true, None).unwrap();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + i as u64);
                for _ in 0..OPS_PER_THREAD {
                    let size = rng.gen_range(16..=4 * KB);
                    if let Ok(ptr) = leaf.allocate(size) {
                        // SAFETY: allocated above with the same size
                        unsafe { leaf.free(ptr, size) };
                    }
                }
                assert_eq!(leaf.used_bytes(), 0);
            })
        })
        .collect();

    let shrinker = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            for _ in 0..200 {
                manager.shrink_pools(16 * KB);
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    shrinker.join().unwrap();
    assert_conserved(&manager);

    drop(roots);
    assert_eq!(manager.arbitrator().stats().free_capacity, CAPACITY);
    assert_eq!(manager.total_bytes(), 0);
}
