//! Pool statistics and diagnostic dumps.

use std::fmt::{self, Write as _};
use std::sync::atomic::Ordering;

use nexus_common::units::succinct_bytes;

use super::MemoryPool;

/// Point-in-time snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryPoolStats {
    /// Bytes currently reserved.
    pub used_bytes: u64,
    /// Highest reserved bytes.
    pub peak_bytes: u64,
    /// Total bytes ever reserved.
    pub cumulative_bytes: u64,
    /// Capacity of the root.
    pub capacity: u64,
    /// Maximum capacity.
    pub max_capacity: u64,
    /// Successful allocations.
    pub num_allocs: u64,
    /// Frees.
    pub num_frees: u64,
    /// Reservation requests.
    pub num_reserves: u64,
    /// Releases.
    pub num_releases: u64,
    /// Capacity grows on the root.
    pub num_grows: u64,
    /// Capacity shrinks on the root.
    pub num_shrinks: u64,
    /// Reclaim requests.
    pub num_reclaims: u64,
    /// Live children.
    pub num_children: usize,
}

impl fmt::Display for MemoryPoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "usedBytes:{} peakBytes:{} cumulativeBytes:{} capacity:{} maxCapacity:{} \
             numAllocs:{} numFrees:{} numReserves:{} numReleases:{} numGrows:{} \
             numShrinks:{} numReclaims:{} numChildren:{}",
            succinct_bytes(self.used_bytes),
            succinct_bytes(self.peak_bytes),
            succinct_bytes(self.cumulative_bytes),
            succinct_bytes(self.capacity),
            succinct_bytes(self.max_capacity),
            self.num_allocs,
            self.num_frees,
            self.num_reserves,
            self.num_releases,
            self.num_grows,
            self.num_shrinks,
            self.num_reclaims,
            self.num_children,
        )
    }
}

impl MemoryPool {
    /// Returns a snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> MemoryPoolStats {
        let (used_bytes, peak_bytes, cumulative_bytes) = {
            let usage = self.usage.lock();
            (usage.used, usage.peak, usage.cumulative)
        };
        let counters = &self.counters;
        MemoryPoolStats {
            used_bytes,
            peak_bytes,
            cumulative_bytes,
            capacity: self.capacity(),
            max_capacity: self.options.max_capacity,
            num_allocs: counters.allocs.load(Ordering::Relaxed),
            num_frees: counters.frees.load(Ordering::Relaxed),
            num_reserves: counters.reserves.load(Ordering::Relaxed),
            num_releases: counters.releases.load(Ordering::Relaxed),
            num_grows: counters.grows.load(Ordering::Relaxed),
            num_shrinks: counters.shrinks.load(Ordering::Relaxed),
            num_reclaims: counters.reclaims.load(Ordering::Relaxed),
            num_children: self.child_count(),
        }
    }

    /// Renders this pool and every live descendant as an indented tree.
    ///
    /// Children are listed by usage, largest first. In debug mode, live
    /// allocations are listed under their leaf.
    #[must_use]
    pub fn tree_memory_usage(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        let stats = self.stats();
        let _ = write!(
            out,
            "{indent}{} usage {} peak {}",
            self.name,
            succinct_bytes(stats.used_bytes),
            succinct_bytes(stats.peak_bytes)
        );
        if self.is_root() {
            let _ = write!(out, " capacity {}", succinct_bytes(stats.capacity));
        }
        out.push('\n');

        if self.options.debug_enabled && self.is_leaf() {
            for line in self.allocation_records().lines() {
                let _ = writeln!(out, "{indent}  {line}");
            }
        }

        let mut children: Vec<_> = self
            .children()
            .into_iter()
            .map(|child| (child.used_bytes(), child))
            .collect();
        children.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        for (_, child) in children {
            child.write_tree(out, depth + 1);
        }
    }
}

impl fmt::Display for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "Memory Pool[{} {} {} {} {}]<max capacity {} capacity {} used {} available {} reservation [used {}, peak {}]>",
            self.name,
            self.kind,
            self.allocator.name(),
            if self.options.track_usage { "track-usage" } else { "no-usage-track" },
            if self.thread_safe { "thread-safe" } else { "non-thread-safe" },
            succinct_bytes(stats.max_capacity),
            succinct_bytes(stats.capacity),
            succinct_bytes(stats.used_bytes),
            succinct_bytes(self.free_capacity()),
            succinct_bytes(stats.used_bytes),
            succinct_bytes(stats.peak_bytes),
        )
    }
}
