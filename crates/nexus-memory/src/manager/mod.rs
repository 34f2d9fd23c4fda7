//! Process-wide memory manager.
//!
//! The manager owns the allocator handle, the arbitrator, an unlimited
//! default root pool for system use, and an index of the root pools it
//! created. It never owns root pools; consumers do.
//!
//! ```text
//!   consumer ──add_root_pool──▶ MemoryManager ──registry (weak)──▶ root pools
//!                                   │
//!   root pool ──grow_pool/drop_pool─┘──▶ MemoryArbitrator (ledger)
//! ```

mod instance;
mod registry;

use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use nexus_common::constants::{
    DEFAULT_ROOT_POOL_NAME, GENERATED_LEAF_POOL_PREFIX, GENERATED_ROOT_POOL_PREFIX, MAX_MEMORY,
    SHARED_LEAF_POOL_PREFIX, SPILL_POOL_NAME,
};
use nexus_common::units::succinct_bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::{alignment_check, MallocAllocator, MemoryAllocator};
use crate::arbitrator::{create_arbitrator, MemoryArbitrator};
use crate::config::MemoryManagerOptions;
use crate::error::{MemoryError, MemoryResult};
use crate::pool::{MemoryPool, PoolGovernor, PoolOptions};
use crate::reclaimer::MemoryReclaimer;

pub use instance::{initialize_memory_manager, memory_manager};
use registry::PoolRegistry;

static NEXT_ROOT_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_LEAF_ID: AtomicU64 = AtomicU64::new(0);

/// State shared between the manager and the root pools it created.
///
/// Root pools hold this as their [`PoolGovernor`], so it outlives the manager
/// if pools do.
struct ManagerCore {
    options: MemoryManagerOptions,
    capacity: u64,
    alignment: u16,
    allocator: Arc<dyn MemoryAllocator>,
    arbitrator: Arc<dyn MemoryArbitrator>,
    registry: PoolRegistry,
}

impl PoolGovernor for ManagerCore {
    fn grow_pool(&self, pool: &MemoryPool, increment_bytes: u64) -> MemoryResult<bool> {
        if pool.capacity() == MAX_MEMORY {
            return Err(MemoryError::invalid_operation(
                pool.name(),
                "the pool already has unlimited capacity",
            ));
        }
        let candidates = self.registry.alive_pools();
        let granted = self
            .arbitrator
            .grow_capacity(pool, &candidates, increment_bytes)?;
        drop(candidates);
        Ok(granted)
    }

    fn drop_pool(&self, pool: &MemoryPool) -> MemoryResult<()> {
        self.registry.remove(pool)?;
        let released = self.arbitrator.shrink_pool(pool, 0);
        debug!(
            pool = pool.name(),
            released = %succinct_bytes(released),
            "dropped root memory pool"
        );
        let used = pool.used_bytes();
        if used != 0 {
            return Err(MemoryError::UsageLeak {
                pool: pool.name().to_string(),
                used,
            });
        }
        Ok(())
    }
}

/// The memory governor.
///
/// Usually accessed as the process-wide instance (see
/// [`MemoryManager::initialize`]), but managers can also be created and
/// passed around directly.
///
/// # Example
///
/// ```rust
/// use nexus_memory::config::MemoryManagerOptions;
/// use nexus_memory::MemoryManager;
///
/// let manager = MemoryManager::new(
///     MemoryManagerOptions::with_capacity(1 << 30).with_init_capacity(1 << 20),
/// )
/// .unwrap();
///
/// let query = manager.add_root_pool("q1", 1 << 28, None).unwrap();
/// assert_eq!(query.capacity(), 1 << 20);
///
/// let leaf = query.add_leaf_child("scan", true, None).unwrap();
/// leaf.reserve(4096).unwrap();
/// leaf.release(4096);
/// ```
pub struct MemoryManager {
    core: Arc<ManagerCore>,
    default_root: Arc<MemoryPool>,
    shared_leaf_pools: Vec<Arc<MemoryPool>>,
    spill_pool: Mutex<Option<Arc<MemoryPool>>>,
    leak_checked: AtomicBool,
}

impl MemoryManager {
    /// Creates a manager with a [`MallocAllocator`] sized to the capacity.
    pub fn new(options: MemoryManagerOptions) -> MemoryResult<Self> {
        let allocator = Arc::new(MallocAllocator::new(options.capacity.as_u64()));
        Self::with_allocator(options, allocator)
    }

    /// Creates a manager on top of `allocator`.
    pub fn with_allocator(
        options: MemoryManagerOptions,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> MemoryResult<Self> {
        let arbitrator = create_arbitrator(&options.arbitrator_config());
        Self::with_arbitrator(options, allocator, arbitrator)
    }

    /// Creates a manager with a caller-provided arbitrator.
    ///
    /// Fails if the allocator's capacity differs from the configured capacity
    /// or the arbitrator's capacity exceeds it.
    pub fn with_arbitrator(
        options: MemoryManagerOptions,
        allocator: Arc<dyn MemoryAllocator>,
        arbitrator: Arc<dyn MemoryArbitrator>,
    ) -> MemoryResult<Self> {
        options.validate()?;
        let capacity = options.capacity.as_u64();
        if allocator.capacity() != capacity {
            return Err(MemoryError::CapacityMismatch {
                allocator: allocator.capacity(),
                manager: capacity,
            });
        }
        if arbitrator.capacity() > capacity {
            return Err(MemoryError::config(format!(
                "arbitrator capacity {} exceeds memory manager capacity {}",
                succinct_bytes(arbitrator.capacity()),
                succinct_bytes(capacity)
            )));
        }
        let alignment = options.effective_alignment();
        alignment_check(0, alignment)?;

        let default_root = MemoryPool::new_root(
            DEFAULT_ROOT_POOL_NAME,
            PoolOptions {
                alignment,
                max_capacity: MAX_MEMORY,
                track_usage: options.track_default_usage,
                debug_enabled: options.debug_enabled,
                fail_on_allocation_failure: options.fail_on_allocation_failure,
            },
            Arc::clone(&allocator),
            None,
            None,
        );
        default_root.grow(MAX_MEMORY)?;

        let shared_leaf_pools = (0..options.num_shared_leaf_pools.max(1))
            .map(|i| default_root.add_leaf_child(format!("{SHARED_LEAF_POOL_PREFIX}{i}"), true, None))
            .collect::<MemoryResult<Vec<_>>>()?;

        info!(
            capacity = %succinct_bytes(capacity),
            alignment,
            arbitrator = %arbitrator.kind(),
            shared_leaf_pools = shared_leaf_pools.len(),
            "memory manager created"
        );

        Ok(Self {
            core: Arc::new(ManagerCore {
                options,
                capacity,
                alignment,
                allocator,
                arbitrator,
                registry: PoolRegistry::default(),
            }),
            default_root,
            shared_leaf_pools,
            spill_pool: Mutex::new(None),
            leak_checked: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Pool creation
    // =========================================================================

    /// Creates a root pool for one consumer.
    ///
    /// An empty `name` gets a generated one. The pool starts with
    /// `min(memory_pool_init_capacity, max_capacity)`, or whatever part of it
    /// the arbitrator can spare.
    pub fn add_root_pool(
        &self,
        name: &str,
        max_capacity: u64,
        reclaimer: Option<Box<dyn MemoryReclaimer>>,
    ) -> MemoryResult<Arc<MemoryPool>> {
        let name = if name.is_empty() {
            format!(
                "{GENERATED_ROOT_POOL_PREFIX}{}",
                NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            name.to_string()
        };
        if name == DEFAULT_ROOT_POOL_NAME {
            return Err(MemoryError::DuplicatePool { name });
        }

        let core = &self.core;
        let options = PoolOptions {
            alignment: core.alignment,
            max_capacity,
            track_usage: true,
            debug_enabled: core.options.debug_enabled,
            fail_on_allocation_failure: core.options.fail_on_allocation_failure,
        };
        let governor: Arc<dyn PoolGovernor> = Arc::clone(core) as Arc<dyn PoolGovernor>;
        let pool = core.registry.insert_with(&name, || {
            MemoryPool::new_root(
                name.clone(),
                options,
                Arc::clone(&core.allocator),
                Some(governor),
                reclaimer,
            )
        })?;

        let init_capacity = core
            .options
            .memory_pool_init_capacity
            .as_u64()
            .min(max_capacity);
        let granted = core.arbitrator.grant_initial_capacity(&pool, init_capacity)?;
        debug!(
            pool = %name,
            max_capacity = %succinct_bytes(max_capacity),
            granted = %succinct_bytes(granted),
            "added root memory pool"
        );
        Ok(pool)
    }

    /// Creates a leaf pool under the default root.
    ///
    /// Its reservations are accounted against unlimited capacity and never
    /// trigger arbitration.
    pub fn add_leaf_pool(&self, name: &str, thread_safe: bool) -> MemoryResult<Arc<MemoryPool>> {
        let name = if name.is_empty() {
            format!(
                "{GENERATED_LEAF_POOL_PREFIX}{}",
                NEXT_LEAF_ID.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            name.to_string()
        };
        self.default_root.add_leaf_child(name, thread_safe, None)
    }

    // =========================================================================
    // Arbitration
    // =========================================================================

    /// Asks the arbitrator to grow `pool` by `increment_bytes`.
    ///
    /// This is what root pools call when a reservation does not fit.
    pub fn grow_pool(&self, pool: &MemoryPool, increment_bytes: u64) -> MemoryResult<bool> {
        self.core.grow_pool(pool, increment_bytes)
    }

    /// Frees up to `target_bytes` across all live root pools, or as much as
    /// possible when zero. Returns the bytes freed.
    pub fn shrink_pools(&self, target_bytes: u64) -> u64 {
        let pools = self.core.registry.alive_pools();
        let freed = self.core.arbitrator.shrink_pools(&pools, target_bytes);
        drop(pools);
        info!(
            target = %succinct_bytes(target_bytes),
            freed = %succinct_bytes(freed),
            "shrunk memory pools"
        );
        freed
    }

    /// Returns every live root pool created by this manager, ordered by name.
    #[must_use]
    pub fn alive_pools(&self) -> Vec<Arc<MemoryPool>> {
        self.core.registry.alive_pools()
    }

    // =========================================================================
    // System pools
    // =========================================================================

    /// Returns the unlimited default root.
    #[must_use]
    pub fn default_root(&self) -> &Arc<MemoryPool> {
        &self.default_root
    }

    /// Returns the shared leaf pool assigned to the calling thread.
    #[must_use]
    pub fn shared_leaf_pool(&self) -> &Arc<MemoryPool> {
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.shared_leaf_pools.len() as u64) as usize;
        &self.shared_leaf_pools[index]
    }

    /// Returns all shared leaf pools.
    #[must_use]
    pub fn shared_leaf_pools(&self) -> &[Arc<MemoryPool>] {
        &self.shared_leaf_pools
    }

    /// Returns the system leaf pool used for spilling, creating it on first use.
    pub fn spill_pool(&self) -> MemoryResult<Arc<MemoryPool>> {
        let mut spill_pool = self.spill_pool.lock();
        if let Some(pool) = spill_pool.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = self.default_root.add_leaf_child(SPILL_POOL_NAME, true, None)?;
        *spill_pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Returns true if `pool` is the spill pool.
    #[must_use]
    pub fn is_spill_pool(&self, pool: &MemoryPool) -> bool {
        self.spill_pool
            .lock()
            .as_ref()
            .is_some_and(|spill| std::ptr::eq(Arc::as_ptr(spill), pool))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the options the manager was created with.
    #[must_use]
    pub fn options(&self) -> &MemoryManagerOptions {
        &self.core.options
    }

    /// Returns the memory budget.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.core.capacity
    }

    /// Returns the allocation alignment.
    #[must_use]
    pub fn alignment(&self) -> u16 {
        self.core.alignment
    }

    /// Returns the number of registered root pools.
    #[must_use]
    pub fn num_pools(&self) -> usize {
        self.core.registry.len()
    }

    /// Returns the bytes currently handed out by the allocator.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.core.allocator.total_used_bytes()
    }

    /// Returns the allocator backend.
    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.core.allocator
    }

    /// Returns the arbitrator.
    #[must_use]
    pub fn arbitrator(&self) -> &Arc<dyn MemoryArbitrator> {
        &self.core.arbitrator
    }

    // =========================================================================
    // Diagnostics and teardown
    // =========================================================================

    /// Renders the manager state. With `detail`, every root pool is dumped as
    /// a tree instead of by name.
    #[must_use]
    pub fn dump(&self, detail: bool) -> String {
        let core = &self.core;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Memory Manager[capacity {} alignment {} usedBytes {} number of pools {}",
            succinct_bytes(core.capacity),
            succinct_bytes(u64::from(core.alignment)),
            succinct_bytes(self.total_bytes()),
            self.num_pools()
        );
        out.push_str("List of root pools:\n");
        if detail {
            out.push_str(&self.default_root.tree_memory_usage());
            for pool in self.alive_pools() {
                out.push_str(&pool.tree_memory_usage());
            }
        } else {
            let _ = writeln!(out, "\t{}", self.default_root.name());
            for name in core.registry.names() {
                let _ = writeln!(out, "\t{name}");
            }
        }
        let _ = writeln!(out, "{}", core.allocator.describe());
        let _ = write!(out, "{}]", core.arbitrator.describe());
        out
    }

    /// Fails with [`MemoryError::LeakedPools`] if any root pool is still
    /// registered.
    pub fn check_usage_leak(&self) -> MemoryResult<()> {
        let registry = &self.core.registry;
        if registry.is_empty() {
            return Ok(());
        }
        let mut report = String::new();
        let alive = registry.alive_pools();
        for name in registry.names() {
            match alive.iter().find(|pool| pool.name() == name) {
                Some(pool) => report.push_str(&pool.tree_memory_usage()),
                None => {
                    let _ = writeln!(report, "{name} (destroying)");
                }
            }
        }
        drop(alive);
        Err(MemoryError::LeakedPools { report })
    }

    /// Tears the manager down, reporting leaked pools instead of panicking.
    pub fn shutdown(self) -> MemoryResult<()> {
        self.leak_checked.store(true, Ordering::Relaxed);
        let result = self.check_usage_leak();
        if let Err(error) = &result {
            warn!(%error, "memory manager shut down with live pools");
        }
        result
    }
}

impl fmt::Display for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump(false))
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("capacity", &self.core.capacity)
            .field("alignment", &self.core.alignment)
            .field("num_pools", &self.num_pools())
            .field("arbitrator", &self.core.arbitrator.kind())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let checked = *self.leak_checked.get_mut();
        if self.core.options.check_usage_leak && !checked && !thread::panicking() {
            if let Err(error) = self.check_usage_leak() {
                error!(%error, "memory manager destroyed with live pools");
                panic!("{error}");
            }
        }
        info!(num_pools = self.num_pools(), "memory manager destroyed");
    }
}
