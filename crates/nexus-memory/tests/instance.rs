//! Process-wide manager lifecycle.
//!
//! Kept in its own test binary with a single test, since the instance is
//! shared by every test in the process.

use nexus_common::constants::MB;
use nexus_memory::{initialize_memory_manager, memory_manager, MemoryError, MemoryManager, MemoryManagerOptions};

fn options(capacity: u64) -> MemoryManagerOptions {
    MemoryManagerOptions::with_capacity(capacity)
        .with_init_capacity(MB)
        .with_num_shared_leaf_pools(2)
}

#[test]
fn test_instance_lifecycle() {
    assert!(matches!(memory_manager(), Err(MemoryError::NotInitialized)));

    let manager = initialize_memory_manager(options(64 * MB)).unwrap();
    assert_eq!(manager.capacity(), 64 * MB);
    assert!(std::sync::Arc::ptr_eq(&manager, &MemoryManager::get_instance().unwrap()));

    let err = MemoryManager::initialize(options(32 * MB)).unwrap_err();
    assert!(matches!(err, MemoryError::AlreadyInitialized { ref existing } if existing.contains("capacity 64.00MB")));

    // Options are ignored once a manager exists.
    let lazy = MemoryManager::deprecated_get_instance(options(8 * MB)).unwrap();
    assert_eq!(lazy.capacity(), 64 * MB);

    let pool = manager.add_root_pool("query", 16 * MB, None).unwrap();
    drop(pool);

    let replaced = MemoryManager::testing_set_instance(options(16 * MB)).unwrap();
    assert_eq!(memory_manager().unwrap().capacity(), 16 * MB);
    drop((manager, lazy));

    let previous = MemoryManager::testing_reset_instance().unwrap();
    assert!(std::sync::Arc::ptr_eq(&previous, &replaced));
    assert!(matches!(memory_manager(), Err(MemoryError::NotInitialized)));
    assert!(MemoryManager::testing_reset_instance().is_none());

    let lazy = MemoryManager::deprecated_get_instance(options(8 * MB)).unwrap();
    assert_eq!(lazy.capacity(), 8 * MB);
    drop(MemoryManager::testing_reset_instance());
}
