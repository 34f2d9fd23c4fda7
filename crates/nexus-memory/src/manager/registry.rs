//! Index of live root pools.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{MemoryError, MemoryResult};
use crate::pool::MemoryPool;

/// Maps root pool names to non-owning handles.
///
/// An entry is removed by the pool's destructor. Between the last strong
/// reference going away and that removal, the entry still holds the name but
/// no longer resolves.
#[derive(Debug, Default)]
pub(crate) struct PoolRegistry {
    pools: RwLock<HashMap<String, Weak<MemoryPool>>>,
}

impl PoolRegistry {
    /// Registers the pool built by `create` under `name`.
    ///
    /// `create` runs under the write lock and must not touch the registry.
    pub(crate) fn insert_with(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<MemoryPool>,
    ) -> MemoryResult<Arc<MemoryPool>> {
        let mut pools = self.pools.write();
        if pools.contains_key(name) {
            return Err(MemoryError::DuplicatePool {
                name: name.to_string(),
            });
        }
        let pool = create();
        pools.insert(name.to_string(), Arc::downgrade(&pool));
        Ok(pool)
    }

    /// Removes `pool`'s entry.
    ///
    /// Fails with [`MemoryError::PoolNotFound`] if the entry is missing or
    /// belongs to a different pool.
    pub(crate) fn remove(&self, pool: &MemoryPool) -> MemoryResult<()> {
        let mut pools = self.pools.write();
        let registered = pools
            .get(pool.name())
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), pool));
        if !registered {
            return Err(MemoryError::PoolNotFound {
                name: pool.name().to_string(),
            });
        }
        pools.remove(pool.name());
        Ok(())
    }

    /// Returns every pool whose handle still resolves, ordered by name.
    pub(crate) fn alive_pools(&self) -> Vec<Arc<MemoryPool>> {
        let mut alive: Vec<_> = self
            .pools
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        alive.sort_by(|a, b| a.name().cmp(b.name()));
        alive
    }

    /// Returns the registered names, ordered.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of entries.
    pub(crate) fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MallocAllocator;
    use crate::pool::PoolOptions;

    fn pool(name: &str) -> Arc<MemoryPool> {
        MemoryPool::new_root(
            name,
            PoolOptions::default(),
            Arc::new(MallocAllocator::unlimited()),
            None,
            None,
        )
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = PoolRegistry::default();
        let a = registry.insert_with("a", || pool("a")).unwrap();
        let b = registry.insert_with("b", || pool("b")).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), ["a", "b"]);

        assert!(matches!(
            registry.insert_with("a", || pool("a")),
            Err(MemoryError::DuplicatePool { .. })
        ));

        registry.remove(&a).unwrap();
        assert!(matches!(
            registry.remove(&a),
            Err(MemoryError::PoolNotFound { .. })
        ));
        assert_eq!(registry.alive_pools().len(), 1);
        assert_eq!(registry.alive_pools()[0].name(), b.name());
    }

    #[test]
    fn test_remove_checks_identity() {
        let registry = PoolRegistry::default();
        let _registered = registry.insert_with("a", || pool("a")).unwrap();
        let impostor = pool("a");
        assert!(registry.remove(&impostor).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dead_entries_are_skipped() {
        let registry = PoolRegistry::default();
        drop(registry.insert_with("gone", || pool("gone")).unwrap());
        assert_eq!(registry.len(), 1);
        assert!(registry.alive_pools().is_empty());
    }
}
