//! Allocator backend contract.
//!
//! The memory governor never touches raw memory itself. Leaf pools hand
//! physical requests to a [`MemoryAllocator`], which owns the real bytes and
//! reports a fixed physical capacity. [`MallocAllocator`] is the default
//! backend built on the global allocator.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use nexus_common::constants::{MAX_ALIGNMENT, MAX_MEMORY, MIN_ALIGNMENT};
use nexus_common::units::succinct_bytes;

use crate::error::{MemoryError, MemoryResult};

/// Validates an alignment, and the size of an allocation made with it.
///
/// The alignment must be at least [`MIN_ALIGNMENT`]. Anything larger must be a
/// power of two no larger than [`MAX_ALIGNMENT`] and must divide
/// `allocate_bytes`.
///
/// # Example
///
/// ```rust
/// use nexus_memory::allocator::alignment_check;
///
/// assert!(alignment_check(0, 16).is_ok());
/// assert!(alignment_check(128, 64).is_ok());
/// assert!(alignment_check(100, 64).is_err());
/// ```
pub fn alignment_check(allocate_bytes: u64, alignment: u16) -> MemoryResult<()> {
    let invalid = |reason: String| MemoryError::InvalidAlignment {
        alignment: u64::from(alignment),
        reason,
    };

    if alignment < MIN_ALIGNMENT {
        return Err(invalid(format!("must be at least {MIN_ALIGNMENT}")));
    }
    if alignment == MIN_ALIGNMENT {
        return Ok(());
    }
    if alignment > MAX_ALIGNMENT {
        return Err(invalid(format!("must be at most {MAX_ALIGNMENT}")));
    }
    if !alignment.is_power_of_two() {
        return Err(invalid("must be a power of 2".to_string()));
    }
    if allocate_bytes % u64::from(alignment) != 0 {
        return Err(invalid(format!(
            "allocation size {allocate_bytes} is not a multiple of the alignment"
        )));
    }
    Ok(())
}

/// Rounds `bytes` up to a multiple of `alignment`.
#[inline]
pub(crate) fn align_up(bytes: u64, alignment: u16) -> Option<u64> {
    let alignment = u64::from(alignment);
    bytes
        .checked_add(alignment - 1)
        .map(|padded| padded / alignment * alignment)
}

/// Physical memory backend consumed by the memory pools.
///
/// Implementations must be thread-safe; every leaf pool in the process may
/// call into the same allocator concurrently.
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Short backend name used in diagnostics.
    fn name(&self) -> &str;

    /// Total physical capacity in bytes. Fixed for the allocator's lifetime.
    fn capacity(&self) -> u64;

    /// Bytes currently handed out.
    fn total_used_bytes(&self) -> u64;

    /// Allocates `bytes` with the given alignment.
    ///
    /// Returns `None` if the backend cannot satisfy the request.
    fn allocate_bytes(&self, bytes: u64, alignment: u16) -> Option<NonNull<u8>>;

    /// Allocates `bytes` of zeroed memory with the given alignment.
    fn allocate_zero_filled(&self, bytes: u64, alignment: u16) -> Option<NonNull<u8>>;

    /// Returns memory obtained from this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate_bytes`](Self::allocate_bytes)
    /// or [`allocate_zero_filled`](Self::allocate_zero_filled) on this
    /// allocator with the same `bytes` and `alignment`, and must not be used
    /// afterwards.
    unsafe fn free_bytes(&self, ptr: NonNull<u8>, bytes: u64, alignment: u16);

    /// One-line description for manager dumps.
    fn describe(&self) -> String {
        format!(
            "Memory Allocator[{} capacity {} allocated bytes {}]",
            self.name(),
            succinct_bytes(self.capacity()),
            succinct_bytes(self.total_used_bytes())
        )
    }
}

/// Allocator backend on top of the global allocator.
///
/// Tracks handed-out bytes and refuses requests that would exceed its
/// capacity.
///
/// # Example
///
/// ```rust
/// use nexus_memory::allocator::{MallocAllocator, MemoryAllocator};
///
/// let allocator = MallocAllocator::new(4096);
/// let ptr = allocator.allocate_bytes(1024, 16).expect("within capacity");
/// assert_eq!(allocator.total_used_bytes(), 1024);
/// unsafe { allocator.free_bytes(ptr, 1024, 16) };
/// assert_eq!(allocator.total_used_bytes(), 0);
/// ```
pub struct MallocAllocator {
    /// Capacity in bytes.
    capacity: u64,
    /// Bytes currently allocated.
    allocated_bytes: AtomicU64,
    /// Number of successful allocations.
    num_allocs: AtomicU64,
    /// Number of frees.
    num_frees: AtomicU64,
}

impl MallocAllocator {
    /// Creates an allocator with the given capacity.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            allocated_bytes: AtomicU64::new(0),
            num_allocs: AtomicU64::new(0),
            num_frees: AtomicU64::new(0),
        }
    }

    /// Creates an allocator without a capacity limit.
    pub fn unlimited() -> Self {
        Self::new(MAX_MEMORY)
    }

    /// Returns the number of successful allocations.
    pub fn num_allocs(&self) -> u64 {
        self.num_allocs.load(Ordering::Relaxed)
    }

    /// Returns the number of frees.
    pub fn num_frees(&self) -> u64 {
        self.num_frees.load(Ordering::Relaxed)
    }

    /// Charges `bytes` against the capacity, or returns false.
    fn try_charge(&self, bytes: u64) -> bool {
        let mut current = self.allocated_bytes.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes).filter(|n| *n <= self.capacity) else {
                return false;
            };
            match self.allocated_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn layout(bytes: u64, alignment: u16) -> Option<Layout> {
        let size = usize::try_from(bytes).ok()?;
        if size == 0 {
            return None;
        }
        Layout::from_size_align(size, usize::from(alignment)).ok()
    }

    fn allocate_with(
        &self,
        bytes: u64,
        alignment: u16,
        raw: unsafe fn(Layout) -> *mut u8,
    ) -> Option<NonNull<u8>> {
        alignment_check(bytes, alignment).ok()?;
        let layout = Self::layout(bytes, alignment)?;
        if !self.try_charge(bytes) {
            return None;
        }

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { raw(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                self.num_allocs.fetch_add(1, Ordering::Relaxed);
                Some(ptr)
            }
            None => {
                self.allocated_bytes.fetch_sub(bytes, Ordering::AcqRel);
                None
            }
        }
    }
}

impl MemoryAllocator for MallocAllocator {
    fn name(&self) -> &str {
        "MALLOC"
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn total_used_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    fn allocate_bytes(&self, bytes: u64, alignment: u16) -> Option<NonNull<u8>> {
        self.allocate_with(bytes, alignment, alloc::alloc)
    }

    fn allocate_zero_filled(&self, bytes: u64, alignment: u16) -> Option<NonNull<u8>> {
        self.allocate_with(bytes, alignment, alloc::alloc_zeroed)
    }

    unsafe fn free_bytes(&self, ptr: NonNull<u8>, bytes: u64, alignment: u16) {
        let layout = Self::layout(bytes, alignment)
            .unwrap_or_else(|| panic!("invalid free of {bytes} bytes with alignment {alignment}"));
        // SAFETY: the caller guarantees ptr was allocated here with this layout
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        let previous = self.allocated_bytes.fetch_sub(bytes, Ordering::AcqRel);
        assert!(
            previous >= bytes,
            "freed {bytes} bytes but only {previous} were allocated"
        );
        self.num_frees.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for MallocAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocAllocator")
            .field("capacity", &self.capacity)
            .field("allocated_bytes", &self.total_used_bytes())
            .field("num_allocs", &self.num_allocs())
            .field("num_frees", &self.num_frees())
            .finish()
    }
}
