//! Tier statistics
//!
//! Counters live in [`TierStats`] as plain atomics so a snapshot is always
//! available; each update is mirrored to the `metrics` facade, which costs
//! nothing unless a recorder is installed.

use super::area::FragStats;
use super::cache::CacheStats;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Register metric descriptions once per process
pub fn init_metrics() {
    if METRICS_INITIALIZED.set(()).is_err() {
        return;
    }
    describe_counter!("hyperhold_reclaim_in_extents_total", "Extents written to the tier");
    describe_counter!("hyperhold_reclaim_in_objects_total", "Objects packed into extents");
    describe_counter!("hyperhold_fault_out_extents_total", "Extents read for a single fault");
    describe_counter!("hyperhold_batch_out_extents_total", "Extents read for a group batch");
    describe_counter!("hyperhold_cache_out_objects_total", "Objects served from the extent cache");
    describe_counter!("hyperhold_compacted_extents_total", "Cached extents moved back to the primary store");
    describe_counter!("hyperhold_shrunk_extents_total", "Cache entries dropped under memory pressure");
    describe_counter!("hyperhold_notify_free_total", "Extents freed by their last object release");
    describe_counter!("hyperhold_alloc_failures_total", "Extent allocations that found no free extent");
    describe_counter!("hyperhold_exceptions_total", "Aborted extent operations");
    describe_gauge!("hyperhold_stored_extents", "Allocated extents");
    describe_gauge!("hyperhold_cached_extents", "Extents held by the cache");
}

/// Monotonic tier counters
#[derive(Debug, Default)]
pub struct TierStats {
    reclaim_in_extents: AtomicU64,
    reclaim_in_objects: AtomicU64,
    reclaim_in_bytes: AtomicU64,
    fault_out_extents: AtomicU64,
    batch_out_extents: AtomicU64,
    cache_out_objects: AtomicU64,
    compacted_extents: AtomicU64,
    compacted_objects: AtomicU64,
    shrunk_extents: AtomicU64,
    notify_free: AtomicU64,
    alloc_failures: AtomicU64,
    exceptions: AtomicU64,
}

impl TierStats {
    pub fn record_reclaim_in(&self, objects: u64, bytes: u64) {
        self.reclaim_in_extents.fetch_add(1, Ordering::Relaxed);
        self.reclaim_in_objects.fetch_add(objects, Ordering::Relaxed);
        self.reclaim_in_bytes.fetch_add(bytes, Ordering::Relaxed);
        counter!("hyperhold_reclaim_in_extents_total").increment(1);
        counter!("hyperhold_reclaim_in_objects_total").increment(objects);
    }

    pub fn record_fault_out(&self) {
        self.fault_out_extents.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_fault_out_extents_total").increment(1);
    }

    pub fn record_batch_out(&self) {
        self.batch_out_extents.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_batch_out_extents_total").increment(1);
    }

    pub fn record_cache_out(&self) {
        self.cache_out_objects.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_cache_out_objects_total").increment(1);
    }

    pub fn record_compaction(&self, objects: u64) {
        self.compacted_extents.fetch_add(1, Ordering::Relaxed);
        self.compacted_objects.fetch_add(objects, Ordering::Relaxed);
        counter!("hyperhold_compacted_extents_total").increment(1);
    }

    pub fn record_shrink(&self, extents: u64) {
        self.shrunk_extents.fetch_add(extents, Ordering::Relaxed);
        counter!("hyperhold_shrunk_extents_total").increment(extents);
    }

    pub fn record_notify_free(&self) {
        self.notify_free.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_notify_free_total").increment(1);
    }

    pub fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_alloc_failures_total").increment(1);
    }

    pub fn record_exception(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
        counter!("hyperhold_exceptions_total").increment(1);
    }

    /// Publish level gauges
    pub fn publish_levels(&self, stored_extents: u32, cached_extents: usize) {
        gauge!("hyperhold_stored_extents").set(stored_extents as f64);
        gauge!("hyperhold_cached_extents").set(cached_extents as f64);
    }

    /// Point-in-time copy, combined with area and cache state
    pub fn snapshot(&self, stored_extents: u32, frag: FragStats, cache: CacheStats) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            reclaim_in_extents: load(&self.reclaim_in_extents),
            reclaim_in_objects: load(&self.reclaim_in_objects),
            reclaim_in_bytes: load(&self.reclaim_in_bytes),
            fault_out_extents: load(&self.fault_out_extents),
            batch_out_extents: load(&self.batch_out_extents),
            cache_out_objects: load(&self.cache_out_objects),
            compacted_extents: load(&self.compacted_extents),
            compacted_objects: load(&self.compacted_objects),
            shrunk_extents: load(&self.shrunk_extents),
            notify_free: load(&self.notify_free),
            alloc_failures: load(&self.alloc_failures),
            exceptions: load(&self.exceptions),
            stored_extents,
            fragmentation: frag,
            cache,
        }
    }
}

/// Serializable statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub reclaim_in_extents: u64,
    pub reclaim_in_objects: u64,
    pub reclaim_in_bytes: u64,
    pub fault_out_extents: u64,
    pub batch_out_extents: u64,
    pub cache_out_objects: u64,
    pub compacted_extents: u64,
    pub compacted_objects: u64,
    pub shrunk_extents: u64,
    pub notify_free: u64,
    pub alloc_failures: u64,
    pub exceptions: u64,
    pub stored_extents: u32,
    pub fragmentation: FragStats,
    pub cache: CacheStats,
}
