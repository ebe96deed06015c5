//! Decompressed extent cache
//!
//! Sparse index from extent id to the extent's backing pages. Entries are
//! reference counted: `delete` removes an entry from the index at once, so
//! later lookups miss, while a reader that cloned the entry moments earlier
//! keeps the pages alive until it drops its handle. A non-zero pin count
//! blocks deletion.

use super::index::{ExtentId, Geometry};
use super::pages::ExtentPages;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A cached extent
#[derive(Debug)]
pub struct CachedExtent {
    id: ExtentId,
    pages: ExtentPages,
    pins: AtomicU32,
}

impl CachedExtent {
    pub fn id(&self) -> ExtentId {
        self.id
    }

    pub fn pages(&self) -> &ExtentPages {
        &self.pages
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

/// Extent cache with pin-protected deletion
pub struct ExtentCache {
    geometry: Geometry,
    index: DashMap<u32, Arc<CachedExtent>>,
    capacity: usize,
    count: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExtentCache {
    pub fn new(geometry: Geometry, capacity: usize) -> Self {
        Self {
            geometry,
            index: DashMap::with_capacity(capacity.min(4096)),
            capacity,
            count: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Publish the pages of `id`, optionally pinned once
    pub fn insert(&self, id: ExtentId, pages: ExtentPages, pin: bool) -> Result<()> {
        self.try_insert(id, pages, pin).map_err(|(e, _)| e)
    }

    /// Like `insert`, but hands the pages back on failure
    pub fn try_insert(
        &self,
        id: ExtentId,
        pages: ExtentPages,
        pin: bool,
    ) -> std::result::Result<(), (Error, ExtentPages)> {
        match self.index.entry(id.0) {
            Entry::Occupied(_) => Err((Error::AlreadyExists(format!("{} already cached", id)), pages)),
            Entry::Vacant(slot) => {
                let cap = self.capacity;
                if let Err(n) = self
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
                {
                    return Err((Error::NoMemory(format!("cache full at {} extents", n)), pages));
                }
                slot.insert(Arc::new(CachedExtent {
                    id,
                    pages,
                    pins: AtomicU32::new(u32::from(pin)),
                }));
                debug!(ext = id.0, pin, "Extent cached");
                Ok(())
            }
        }
    }

    /// Lock-free existence check
    pub fn lookup(&self, id: ExtentId) -> bool {
        self.index.contains_key(&id.0)
    }

    /// Reader handle; the pages stay valid for as long as it is held
    pub fn get(&self, id: ExtentId) -> Option<Arc<CachedExtent>> {
        let found = self.index.get(&id.0).map(|e| e.value().clone());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Copy `dst.len()` bytes at the in-extent offset encoded in `src_addr`
    pub fn read(&self, id: ExtentId, src_addr: u64, dst: &mut [u8]) -> Result<()> {
        if self.geometry.extent_of(src_addr) != id {
            return Err(Error::InvalidArgument(format!(
                "address {:#x} is not inside {}",
                src_addr, id
            )));
        }
        let entry = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("{} not cached", id)))?;
        entry.pages.read_at(self.geometry.offset_of(src_addr), dst)
    }

    /// Remove an unpinned entry from the index
    pub fn delete(&self, id: ExtentId) -> Result<()> {
        if self.index.remove_if(&id.0, |_, e| e.pins() == 0).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            debug!(ext = id.0, "Extent uncached");
            return Ok(());
        }
        if self.index.contains_key(&id.0) {
            Err(Error::Busy(format!("{} is pinned", id)))
        } else {
            Err(Error::NotFound(format!("{} not cached", id)))
        }
    }

    /// Remove the entry for `id` whatever its pin count
    ///
    /// Used when the extent itself goes away. Readers holding the entry keep
    /// its pages; later pins and unpins of `id` miss.
    pub fn supersede(&self, id: ExtentId) -> Option<Arc<CachedExtent>> {
        let (_, entry) = self.index.remove(&id.0)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        debug!(ext = id.0, pins = entry.pins(), "Extent entry superseded");
        Some(entry)
    }

    /// Take a pin; false if the extent is not cached
    pub fn pin(&self, id: ExtentId) -> bool {
        // The shard read lock is held across the increment so a concurrent
        // delete either sees the pin or removes the entry first.
        match self.index.get(&id.0) {
            Some(entry) => {
                entry.pins.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Drop a pin; false if the extent is not cached
    pub fn unpin(&self, id: ExtentId) -> bool {
        let Some(entry) = self.index.get(&id.0) else {
            return false;
        };
        if entry
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_err()
        {
            warn!(ext = id.0, "Unpin of unpinned cache entry");
        }
        true
    }

    pub fn pins(&self, id: ExtentId) -> Option<u32> {
        self.index.get(&id.0).map(|e| e.pins())
    }

    /// Remove every unpinned entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.index.retain(|_, e| {
            if e.pins() == 0 {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.count.fetch_sub(removed, Ordering::AcqRel);
        debug!(removed, "Extent cache cleared");
        removed
    }

    /// Number of cached extents
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached extent ids, ascending
    pub fn ids(&self) -> Vec<ExtentId> {
        let mut ids: Vec<_> = self.index.iter().map(|e| ExtentId(*e.key())).collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}
