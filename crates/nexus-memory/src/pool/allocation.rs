//! Allocation path for leaf pools.
//!
//! Every allocation is first reserved against the pool tree, then requested
//! from the allocator backend. Sizes are rounded up to the pool alignment, and
//! the rounded size is what gets reserved and later released.

use std::fmt::Write as _;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use super::MemoryPool;
use crate::allocator::align_up;
use crate::error::{MemoryError, MemoryResult};

impl MemoryPool {
    /// Allocates `size` bytes.
    ///
    /// Fails with a capacity error if the reservation cannot be satisfied,
    /// or with [`MemoryError::AllocationFailed`] if the backend refuses.
    pub fn allocate(&self, size: u64) -> MemoryResult<NonNull<u8>> {
        self.allocate_with(size, false)
    }

    /// Allocates `num_entries * size_each` zeroed bytes.
    pub fn allocate_zero_filled(&self, num_entries: u64, size_each: u64) -> MemoryResult<NonNull<u8>> {
        let size = num_entries.checked_mul(size_each).ok_or_else(|| {
            MemoryError::inconsistent(format!(
                "zero-filled allocation of {num_entries} x {size_each} bytes overflows"
            ))
        })?;
        self.allocate_with(size, true)
    }

    /// Moves an allocation to a new buffer of `new_size` bytes.
    ///
    /// The first `min(size, new_size)` bytes are copied over. On failure the
    /// original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated from this pool with `size` bytes and
    /// must not be used after this call succeeds.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        size: u64,
        new_size: u64,
    ) -> MemoryResult<NonNull<u8>> {
        let new_ptr = self.allocate(new_size)?;
        let copied = usize::try_from(size.min(new_size))
            .map_err(|_| MemoryError::inconsistent("reallocation size does not fit in memory"))?;
        // SAFETY: both buffers hold at least `copied` bytes and are distinct
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copied);
            self.free(ptr, size);
        }
        Ok(new_ptr)
    }

    /// Returns an allocation to the backend and releases its reservation.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated from this pool with `size` bytes and
    /// must not be used afterwards.
    ///
    /// # Panics
    ///
    /// In debug mode, panics if `ptr` is unknown or was allocated with a
    /// different size.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: u64) {
        let alignment = self.options.alignment;
        let aligned = align_up(size, alignment)
            .unwrap_or_else(|| panic!("freed size {size} overflows the alignment {alignment}"));

        if self.options.debug_enabled {
            let address = ptr.as_ptr() as usize;
            match self.allocations.lock().remove(&address) {
                Some(recorded) if recorded == aligned => {}
                Some(recorded) => panic!(
                    "{}",
                    MemoryError::inconsistent(format!(
                        "memory pool '{}' freed {address:#x} with {aligned} bytes, allocated with {recorded}",
                        self.name
                    ))
                ),
                None => panic!(
                    "{}",
                    MemoryError::inconsistent(format!(
                        "memory pool '{}' freed unknown allocation {address:#x}",
                        self.name
                    ))
                ),
            }
        }

        // SAFETY: the caller guarantees ptr came from this pool with this size
        unsafe { self.allocator.free_bytes(ptr, aligned, alignment) };
        self.release(aligned);
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate_with(&self, size: u64, zero_filled: bool) -> MemoryResult<NonNull<u8>> {
        self.check_leaf("allocate")?;
        if size == 0 {
            return Err(MemoryError::invalid_operation(
                &self.name,
                "allocation size must be positive",
            ));
        }
        let alignment = self.options.alignment;
        let aligned = align_up(size, alignment).ok_or_else(|| {
            MemoryError::inconsistent(format!("allocation of {size} bytes overflows when aligned"))
        })?;

        self.reserve(aligned)?;
        let allocated = if zero_filled {
            self.allocator.allocate_zero_filled(aligned, alignment)
        } else {
            self.allocator.allocate_bytes(aligned, alignment)
        };
        let Some(ptr) = allocated else {
            self.release(aligned);
            return Err(self.on_capacity_failure(MemoryError::AllocationFailed {
                pool: self.name.clone(),
                bytes: aligned,
            }));
        };

        self.counters.allocs.fetch_add(1, Ordering::Relaxed);
        if self.options.debug_enabled {
            self.allocations
                .lock()
                .insert(ptr.as_ptr() as usize, aligned);
        }
        Ok(ptr)
    }

    /// Renders the live allocation records, one per line. Empty unless debug
    /// mode is on.
    pub(super) fn allocation_records(&self) -> String {
        let allocations = self.allocations.lock();
        let mut records: Vec<_> = allocations.iter().collect();
        records.sort_unstable();

        let mut out = String::new();
        for (address, size) in records {
            let _ = writeln!(out, "  allocation {address:#x} size {size}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::{MallocAllocator, MemoryAllocator};
    use crate::pool::PoolOptions;

    fn root_with(options: PoolOptions, allocator: Arc<MallocAllocator>) -> Arc<MemoryPool> {
        let root = MemoryPool::new_root("root", options, allocator, None, None);
        root.grow(options.max_capacity).unwrap();
        root
    }

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let allocator = Arc::new(MallocAllocator::unlimited());
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::clone(&allocator),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let ptr = leaf.allocate(10).unwrap();
        assert_eq!(leaf.used_bytes(), 16);
        assert_eq!(root.used_bytes(), 16);
        assert_eq!(allocator.total_used_bytes(), 16);

        unsafe { leaf.free(ptr, 10) };
        assert_eq!(leaf.used_bytes(), 0);
        assert_eq!(allocator.total_used_bytes(), 0);
        assert_eq!(leaf.stats().num_allocs, 1);
        assert_eq!(leaf.stats().num_frees, 1);
    }

    #[test]
    fn test_allocate_zero_filled() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let ptr = leaf.allocate_zero_filled(8, 32).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert_eq!(leaf.used_bytes(), 256);

        unsafe { leaf.free(ptr, 256) };
        assert!(leaf.allocate_zero_filled(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_allocate_rejects_aggregate_and_zero() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::new(MallocAllocator::unlimited()),
        );
        assert!(matches!(
            root.allocate(16),
            Err(MemoryError::InvalidOperation { .. })
        ));

        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        assert!(matches!(
            leaf.allocate(0),
            Err(MemoryError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_allocation_size_overflow() {
        let allocator = Arc::new(MallocAllocator::unlimited());
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::clone(&allocator),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        assert!(matches!(
            leaf.allocate_zero_filled(u64::MAX, 2),
            Err(MemoryError::Inconsistent { .. })
        ));
        assert!(matches!(
            leaf.allocate(u64::MAX),
            Err(MemoryError::Inconsistent { .. })
        ));
        assert_eq!(leaf.used_bytes(), 0);
        assert_eq!(allocator.total_used_bytes(), 0);
        assert_eq!(leaf.stats().num_allocs, 0);
    }

    #[test]
    fn test_allocate_over_capacity() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(1024),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let err = leaf.allocate(2048).unwrap_err();
        assert!(err.is_capacity_exhausted());
        assert_eq!(leaf.used_bytes(), 0);
    }

    #[test]
    fn test_backend_failure_rolls_back_reservation() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::new(MallocAllocator::new(1024)),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let err = leaf.allocate(2048).unwrap_err();
        assert!(matches!(err, MemoryError::AllocationFailed { bytes: 2048, .. }));
        assert_eq!(leaf.used_bytes(), 0);
        assert_eq!(root.used_bytes(), 0);
    }

    #[test]
    fn test_reallocate_copies_contents() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let ptr = leaf.allocate(16).unwrap();
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0xAB, 16) };

        let grown = unsafe { leaf.reallocate(ptr, 16, 64) }.unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 16) };
        assert!(bytes.iter().all(|b| *b == 0xAB));
        assert_eq!(leaf.used_bytes(), 64);

        unsafe { leaf.free(grown, 64) };
        assert_eq!(leaf.used_bytes(), 0);
    }

    #[test]
    fn test_debug_records_allocations() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096).with_debug(true),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();

        let ptr = leaf.allocate(100).unwrap();
        let records = leaf.allocation_records();
        assert!(records.contains("size 112"));

        unsafe { leaf.free(ptr, 100) };
        assert!(leaf.allocation_records().is_empty());
    }

    #[test]
    #[should_panic(expected = "allocated with 32")]
    fn test_debug_free_size_mismatch_panics() {
        let root = root_with(
            PoolOptions::default().with_max_capacity(4096).with_debug(true),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        let ptr = leaf.allocate(32).unwrap();
        unsafe { leaf.free(ptr, 64) };
    }

    #[test]
    #[should_panic(expected = "exceeded memory pool cap")]
    fn test_fail_on_allocation_failure_panics() {
        let root = root_with(
            PoolOptions::default()
                .with_max_capacity(1024)
                .with_fail_on_allocation_failure(true),
            Arc::new(MallocAllocator::unlimited()),
        );
        let leaf = root.add_leaf_child("leaf", true, None).unwrap();
        let _ = leaf.allocate(4096);
    }
}
