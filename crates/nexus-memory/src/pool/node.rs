//! Pool tree node and capacity accounting.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

use nexus_common::units::succinct_bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use super::{PoolGovernor, PoolKind, PoolOptions, PoolState};
use crate::allocator::MemoryAllocator;
use crate::error::{MemoryError, MemoryResult};
use crate::reclaimer::MemoryReclaimer;

/// Monotonic activity clock shared by every pool in the process.
static ACTIVITY_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Byte counters guarded by the pool's usage lock.
#[derive(Debug, Default)]
pub(super) struct Usage {
    /// Granted capacity. Only meaningful on root pools.
    pub(super) capacity: u64,
    pub(super) used: u64,
    pub(super) peak: u64,
    pub(super) cumulative: u64,
}

impl Usage {
    fn record(&mut self, bytes: u64) {
        self.used += bytes;
        self.peak = self.peak.max(self.used);
        self.cumulative = self.cumulative.saturating_add(bytes);
    }
}

/// Operation counters.
#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) allocs: AtomicU64,
    pub(super) frees: AtomicU64,
    pub(super) reserves: AtomicU64,
    pub(super) releases: AtomicU64,
    pub(super) grows: AtomicU64,
    pub(super) shrinks: AtomicU64,
    pub(super) reclaims: AtomicU64,
}

/// A node in the memory pool tree.
///
/// Root pools are created by the memory manager and hold the capacity the
/// arbitrator granted them. Children are created with
/// [`add_leaf_child`](Self::add_leaf_child) and
/// [`add_aggregate_child`](Self::add_aggregate_child) and keep their parent
/// alive for as long as they exist.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use nexus_memory::allocator::MallocAllocator;
/// use nexus_memory::pool::{MemoryPool, PoolOptions};
///
/// let root = MemoryPool::new_root(
///     "query",
///     PoolOptions::default().with_max_capacity(1 << 20),
///     Arc::new(MallocAllocator::unlimited()),
///     None,
///     None,
/// );
/// root.grow(1 << 20).unwrap();
///
/// let leaf = root.add_leaf_child("scan", true, None).unwrap();
/// leaf.reserve(4096).unwrap();
/// assert_eq!(root.used_bytes(), 4096);
/// leaf.release(4096);
/// ```
pub struct MemoryPool {
    pub(super) name: String,
    pub(super) kind: PoolKind,
    pub(super) parent: Option<Arc<MemoryPool>>,
    pub(super) options: PoolOptions,
    pub(super) thread_safe: bool,
    owner_thread: ThreadId,
    pub(super) allocator: Arc<dyn MemoryAllocator>,
    governor: Option<Arc<dyn PoolGovernor>>,
    reclaimer: Option<Box<dyn MemoryReclaimer>>,
    state: AtomicU8,
    pub(super) usage: Mutex<Usage>,
    children: RwLock<BTreeMap<String, Weak<MemoryPool>>>,
    pub(super) counters: Counters,
    last_active: AtomicU64,
    /// Live allocations by address. Only populated in debug mode.
    pub(super) allocations: Mutex<HashMap<usize, u64>>,
}

impl MemoryPool {
    fn node(
        name: String,
        kind: PoolKind,
        parent: Option<Arc<MemoryPool>>,
        options: PoolOptions,
        thread_safe: bool,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Self {
        Self {
            name,
            kind,
            parent,
            options,
            thread_safe,
            owner_thread: thread::current().id(),
            allocator,
            governor: None,
            reclaimer: None,
            state: AtomicU8::new(PoolState::Active as u8),
            usage: Mutex::new(Usage::default()),
            children: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
            last_active: AtomicU64::new(ACTIVITY_CLOCK.fetch_add(1, Ordering::Relaxed)),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a root pool with zero capacity.
    ///
    /// `governor` is consulted whenever a reservation does not fit in the
    /// current capacity. Without one, growth is only possible through
    /// [`grow`](Self::grow).
    #[must_use]
    pub fn new_root(
        name: impl Into<String>,
        options: PoolOptions,
        allocator: Arc<dyn MemoryAllocator>,
        governor: Option<Arc<dyn PoolGovernor>>,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> Arc<Self> {
        let mut pool = Self::node(name.into(), PoolKind::Aggregate, None, options, true, allocator);
        pool.governor = governor;
        pool.reclaimer = reclaimer;
        debug!(
            pool = %pool.name,
            max_capacity = %succinct_bytes(options.max_capacity),
            "created root memory pool"
        );
        Arc::new(pool)
    }

    /// Creates a leaf child pool.
    ///
    /// Fails with [`MemoryError::DuplicatePool`] if a child with the same name
    /// is still registered.
    pub fn add_leaf_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        thread_safe: bool,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> MemoryResult<Arc<Self>> {
        self.add_child(name.into(), PoolKind::Leaf, thread_safe, reclaimer)
    }

    /// Creates an aggregate child pool.
    pub fn add_aggregate_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> MemoryResult<Arc<Self>> {
        self.add_child(name.into(), PoolKind::Aggregate, true, reclaimer)
    }

    fn add_child(
        self: &Arc<Self>,
        name: String,
        kind: PoolKind,
        thread_safe: bool,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> MemoryResult<Arc<Self>> {
        if self.kind == PoolKind::Leaf {
            return Err(MemoryError::invalid_operation(
                &self.name,
                "a leaf pool cannot have children",
            ));
        }
        if name.is_empty() {
            return Err(MemoryError::invalid_operation(
                &self.name,
                "child pool name must not be empty",
            ));
        }
        self.check_active()?;

        let mut children = self.children.write();
        if children.contains_key(&name) {
            return Err(MemoryError::DuplicatePool { name });
        }

        let mut child = Self::node(
            name.clone(),
            kind,
            Some(Arc::clone(self)),
            self.options,
            thread_safe,
            Arc::clone(&self.allocator),
        );
        child.reclaimer = reclaimer;
        let child = Arc::new(child);
        children.insert(name, Arc::downgrade(&child));
        drop(children);

        debug!(parent = %self.name, pool = %child.name, kind = %kind, "created child memory pool");
        Ok(child)
    }

    /// Called from a child's destructor.
    fn remove_child(&self, name: &str, child: *const MemoryPool) {
        let mut children = self.children.write();
        if children
            .get(name)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), child))
        {
            children.remove(name);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the pool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the pool kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Returns true for leaf pools.
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.kind == PoolKind::Leaf
    }

    /// Returns true for root pools.
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns the parent pool, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<MemoryPool>> {
        self.parent.as_ref()
    }

    /// Returns the root of this pool's tree.
    #[must_use]
    pub fn root(&self) -> &MemoryPool {
        let mut pool = self;
        while let Some(parent) = &pool.parent {
            pool = parent;
        }
        pool
    }

    /// Returns the creation options.
    #[must_use]
    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Returns the allocation alignment.
    #[must_use]
    pub fn alignment(&self) -> u16 {
        self.options.alignment
    }

    /// Returns the maximum capacity.
    #[must_use]
    pub fn max_capacity(&self) -> u64 {
        self.options.max_capacity
    }

    /// Returns whether the pool may be used from any thread.
    #[must_use]
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Returns the allocator backend.
    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Returns the capacity held by the root of this pool's tree.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.root().usage.lock().capacity
    }

    /// Returns the bytes reserved by this pool and its descendants.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.usage.lock().used
    }

    /// Returns the highest value [`used_bytes`](Self::used_bytes) reached.
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.usage.lock().peak
    }

    /// Returns the root's capacity that is not reserved.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        let usage = self.root().usage.lock();
        usage.capacity.saturating_sub(usage.used)
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the activity tick of the latest reservation in this subtree.
    #[must_use]
    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Returns true if a reclaimer is attached.
    #[must_use]
    pub fn has_reclaimer(&self) -> bool {
        self.reclaimer.is_some()
    }

    /// Returns the live children, ordered by name.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<MemoryPool>> {
        self.children
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Returns the number of live children.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children
            .read()
            .values()
            .filter(|child| child.strong_count() > 0)
            .count()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Moves the pool from `Active` to `Draining`.
    ///
    /// New reservations in this subtree fail with
    /// [`MemoryError::PoolNotActive`]; releases keep working. Returns false if
    /// the pool was not active.
    pub fn begin_drain(&self) -> bool {
        let drained = self
            .state
            .compare_exchange(
                PoolState::Active as u8,
                PoolState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if drained {
            debug!(pool = %self.name, used = self.used_bytes(), "memory pool draining");
        }
        drained
    }

    fn check_active(&self) -> MemoryResult<()> {
        match self.state() {
            PoolState::Active => Ok(()),
            state => Err(MemoryError::PoolNotActive {
                pool: self.name.clone(),
                state,
            }),
        }
    }

    pub(super) fn check_leaf(&self, operation: &str) -> MemoryResult<()> {
        if self.is_leaf() {
            Ok(())
        } else {
            Err(MemoryError::invalid_operation(
                &self.name,
                format!("{operation} is only supported on leaf pools"),
            ))
        }
    }

    fn check_owner_thread(&self) {
        if self.options.debug_enabled && !self.thread_safe {
            assert_eq!(
                thread::current().id(),
                self.owner_thread,
                "non-thread-safe memory pool '{}' used from a foreign thread",
                self.name
            );
        }
    }

    fn touch(&self) {
        self.last_active
            .store(ACTIVITY_CLOCK.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Panics on capacity errors when the pool was configured to fail hard.
    pub(super) fn on_capacity_failure(&self, error: MemoryError) -> MemoryError {
        if self.options.fail_on_allocation_failure && error.is_capacity_exhausted() {
            panic!("{error}");
        }
        error
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Reserves `bytes` in this leaf and every ancestor.
    ///
    /// If the root's capacity is insufficient, the root asks its governor for
    /// more before failing with [`MemoryError::CapacityExceeded`].
    pub fn reserve(&self, bytes: u64) -> MemoryResult<()> {
        self.try_reserve(bytes)
            .map_err(|error| self.on_capacity_failure(error))
    }

    /// Like [`reserve`](Self::reserve), but reports failure as `false` and
    /// never panics on capacity errors.
    pub fn maybe_reserve(&self, bytes: u64) -> bool {
        self.try_reserve(bytes).is_ok()
    }

    fn try_reserve(&self, bytes: u64) -> MemoryResult<()> {
        self.check_leaf("reserve")?;
        self.check_owner_thread();
        self.counters.reserves.fetch_add(1, Ordering::Relaxed);

        if !self.options.track_usage || bytes == 0 {
            let mut pool = Some(self);
            while let Some(current) = pool {
                current.check_active()?;
                pool = current.parent.as_deref();
            }
            return Ok(());
        }

        while !self.increment_reservation(self, bytes)? {}
        Ok(())
    }

    /// Commits `bytes` from the root down to this pool.
    ///
    /// Returns `Ok(false)` when the root grew and the reservation must be
    /// retried. Nothing is committed unless the root accepted the bytes.
    fn increment_reservation(&self, requestor: &MemoryPool, bytes: u64) -> MemoryResult<bool> {
        self.check_active()?;

        if let Some(parent) = &self.parent {
            if !parent.increment_reservation(requestor, bytes)? {
                return Ok(false);
            }
            self.usage.lock().record(bytes);
            self.touch();
            return Ok(true);
        }

        let (used, capacity) = {
            let mut usage = self.usage.lock();
            let Some(total) = usage.used.checked_add(bytes) else {
                return Err(MemoryError::inconsistent(format!(
                    "reserving {bytes} bytes on memory pool '{}' overflows its usage",
                    self.name
                )));
            };
            if total <= usage.capacity {
                usage.record(bytes);
                drop(usage);
                self.touch();
                return Ok(true);
            }
            (usage.used, usage.capacity)
        };

        let exceeded = || MemoryError::CapacityExceeded {
            pool: requestor.name.clone(),
            requested: bytes,
            used,
            capacity,
            max_capacity: self.options.max_capacity,
            manager_capacity: self.allocator.capacity(),
        };

        if used + bytes > self.options.max_capacity {
            return Err(exceeded());
        }
        let Some(governor) = &self.governor else {
            return Err(exceeded());
        };
        if governor.grow_pool(self, used + bytes - capacity)? {
            Ok(false)
        } else {
            Err(exceeded())
        }
    }

    /// Releases `bytes` previously reserved on this leaf.
    ///
    /// # Panics
    ///
    /// Panics if the pool is not a leaf or if more is released than reserved.
    pub fn release(&self, bytes: u64) {
        assert!(
            self.is_leaf(),
            "release is only supported on leaf pools, '{}' is {}",
            self.name,
            self.kind
        );
        self.check_owner_thread();
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        if self.options.track_usage && bytes > 0 {
            self.decrement_reservation(bytes);
        }
    }

    fn decrement_reservation(&self, bytes: u64) {
        {
            let mut usage = self.usage.lock();
            if usage.used < bytes {
                let error = MemoryError::inconsistent(format!(
                    "memory pool '{}' released {bytes} bytes but only {} are reserved",
                    self.name, usage.used
                ));
                drop(usage);
                panic!("{error}");
            }
            usage.used -= bytes;
        }
        if let Some(parent) = &self.parent {
            parent.decrement_reservation(bytes);
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Adds `bytes` to the root's capacity and returns the new capacity.
    ///
    /// Growing past the max capacity is a consistency violation.
    pub fn grow(&self, bytes: u64) -> MemoryResult<u64> {
        let root = self.root();
        let mut usage = root.usage.lock();
        let Some(capacity) = usage
            .capacity
            .checked_add(bytes)
            .filter(|capacity| *capacity <= root.options.max_capacity)
        else {
            return Err(MemoryError::inconsistent(format!(
                "growing memory pool '{}' by {} from {} exceeds its max capacity {}",
                root.name,
                succinct_bytes(bytes),
                succinct_bytes(usage.capacity),
                succinct_bytes(root.options.max_capacity)
            )));
        };
        usage.capacity = capacity;
        drop(usage);

        root.counters.grows.fetch_add(1, Ordering::Relaxed);
        Ok(capacity)
    }

    /// Releases unused capacity from the root and returns the bytes freed.
    ///
    /// At most `target_bytes` are freed, or all unused capacity when
    /// `target_bytes` is zero. Reserved bytes are never touched.
    pub fn shrink(&self, target_bytes: u64) -> u64 {
        let root = self.root();
        let mut usage = root.usage.lock();
        let unused = usage.capacity.saturating_sub(usage.used);
        let freed = if target_bytes == 0 {
            unused
        } else {
            unused.min(target_bytes)
        };
        usage.capacity -= freed;
        drop(usage);

        root.counters.shrinks.fetch_add(1, Ordering::Relaxed);
        freed
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Returns how much the attached reclaimer could release.
    #[must_use]
    pub fn reclaimable_bytes(&self) -> Option<u64> {
        self.reclaimer.as_ref()?.reclaimable_bytes(self)
    }

    /// Asks the attached reclaimer to release `target_bytes`, or everything
    /// when zero. Returns the bytes released.
    pub fn reclaim(&self, target_bytes: u64, deadline: Instant) -> u64 {
        let Some(reclaimer) = &self.reclaimer else {
            return 0;
        };
        self.counters.reclaims.fetch_add(1, Ordering::Relaxed);
        let reclaimed = reclaimer.reclaim(self, target_bytes, deadline);
        debug!(
            pool = %self.name,
            target = target_bytes,
            reclaimed,
            "reclaimed memory pool usage"
        );
        reclaimed
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("used_bytes", &self.used_bytes())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.options.max_capacity)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.state.store(PoolState::Destroyed as u8, Ordering::Release);
        let used = self.usage.get_mut().used;
        let governor = self.governor.take();
        let this: *const MemoryPool = &*self;

        if let Some(parent) = &self.parent {
            parent.remove_child(&self.name, this);
        }
        let dropped = governor.map(|governor| governor.drop_pool(&*self));

        let leak = (used != 0).then(|| MemoryError::UsageLeak {
            pool: self.name.clone(),
            used,
        });
        if let Some(leak) = leak {
            let records = self.allocation_records();
            if thread::panicking() {
                error!(pool = %self.name, used, "memory pool destroyed while unwinding with live usage");
                return;
            }
            if records.is_empty() {
                panic!("{leak}");
            }
            panic!("{leak}\n{records}");
        }
        if let Some(Err(error)) = dropped {
            if !thread::panicking() {
                panic!("{error}");
            }
        }
    }
}
