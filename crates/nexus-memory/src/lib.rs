//! # nexus-memory
//!
//! Memory pools and capacity arbitration for NexusDB query execution.
//!
//! This crate governs how much memory each query may use:
//!
//! - **Pools**: A tree per query. Leaves serve allocations and reservations,
//!   aggregates roll usage up, and only the root holds capacity.
//! - **Arbitrator**: Moves capacity between root pools under a fixed budget,
//!   reclaiming from idle or reclaimable pools when the budget runs out.
//! - **Manager**: Owns the allocator and the arbitrator, indexes live root
//!   pools, and reports leaks at teardown.
//!
//! ## Example
//!
//! ```rust
//! use nexus_memory::{MemoryManager, MemoryManagerOptions};
//!
//! let manager = MemoryManager::new(
//!     MemoryManagerOptions::with_capacity(64 << 20).with_init_capacity(1 << 20),
//! )
//! .unwrap();
//!
//! let query = manager.add_root_pool("query-1", 32 << 20, None).unwrap();
//! let join = query.add_aggregate_child("join", None).unwrap();
//! let build = join.add_leaf_child("build", true, None).unwrap();
//!
//! let ptr = build.allocate(4096).unwrap();
//! assert_eq!(query.used_bytes(), 4096);
//! unsafe { build.free(ptr, 4096) };
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod arbitrator;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod reclaimer;

pub use allocator::{MallocAllocator, MemoryAllocator};
pub use arbitrator::{ArbitratorKind, MemoryArbitrator, SharedArbitrator};
pub use config::MemoryManagerOptions;
pub use error::{MemoryError, MemoryResult};
pub use manager::{initialize_memory_manager, memory_manager, MemoryManager};
pub use pool::{MemoryPool, MemoryPoolStats, PoolKind, PoolOptions, PoolState};
pub use reclaimer::{MemoryReclaimer, TreeReclaimer};
