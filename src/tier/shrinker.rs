//! Memory-pressure callbacks
//!
//! An external reclaim runtime polls `count` and then asks `scan` to give
//! pages back. Nothing here is scheduled internally.

use super::manager::Manager;
use super::store::PrimaryStore;

/// Pull-based reclaim interface
pub trait Shrinker: Send + Sync {
    /// Estimate of reclaimable pages
    fn count(&self) -> u64;

    /// Reclaim up to `nr_pages` pages, returning how many were freed
    fn scan(&self, nr_pages: u64) -> u64;
}

impl<S: PrimaryStore> Shrinker for Manager<S> {
    fn count(&self) -> u64 {
        self.cached_pages()
    }

    fn scan(&self, nr_pages: u64) -> u64 {
        self.shrink(nr_pages)
    }
}
