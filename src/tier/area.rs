//! Extent area: bitmap allocation, group chains and fragmentation accounting
//!
//! The area is the per-device context for the secondary tier. It owns the
//! extent bitmap, both list tables (object lane and extent lane), the extent
//! cache and every per-extent and per-group counter.
//!
//! Extent states as seen by the area:
//!
//! ```text
//!   free ──allocate──▶ claimed (filling) ──checkin──▶ chained (ready)
//!     ▲                    │    ▲                          │
//!     └──────free──────────┘    └────checkout / pick───────┘
//! ```
//!
//! A claimed extent is owned by exactly one caller. A chained extent sits in
//! its owner's extent LRU and may be claimed by `checkout_extent` or
//! `pick_extent`.

use super::bitmap::ExtentBitmap;
use super::cache::ExtentCache;
use super::group::GroupDirectory;
use super::index::{ExtentId, Geometry, GroupId, IndexSpace};
use super::list::{Chain, Lane, ListTable};
use crate::config::AreaConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Extent eligibility predicate for [`Area::pick_extent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentFilter {
    /// Every chained extent
    Any,
    /// Extents without a cache entry
    NotCached,
    /// Cached, unpinned extents storing at most `max_bytes`
    Evictable { max_bytes: u64 },
}

/// Fragmentation snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FragStats {
    /// Maximal contiguous-id runs summed over all groups
    pub runs: i64,
    /// Groups with at least one chained extent
    pub groups: u32,
    /// Chained extents
    pub extents: u32,
}

#[derive(Debug)]
struct Fragmentation {
    runs: Box<[AtomicI64]>,
    linked: Box<[AtomicU32]>,
    total_runs: AtomicI64,
    active_groups: AtomicU32,
    linked_exts: AtomicU32,
}

impl Fragmentation {
    fn new(nr_groups: usize) -> Self {
        Self {
            runs: (0..nr_groups).map(|_| AtomicI64::new(0)).collect(),
            linked: (0..nr_groups).map(|_| AtomicU32::new(0)).collect(),
            total_runs: AtomicI64::new(0),
            active_groups: AtomicU32::new(0),
            linked_exts: AtomicU32::new(0),
        }
    }

    fn inserted(&self, group: GroupId, left: bool, right: bool) {
        let delta = match (left, right) {
            (true, true) => -1,
            (false, false) => 1,
            _ => 0,
        };
        let g = group.0 as usize;
        self.runs[g].fetch_add(delta, Ordering::Relaxed);
        self.total_runs.fetch_add(delta, Ordering::Relaxed);
        if self.linked[g].fetch_add(1, Ordering::Relaxed) == 0 {
            self.active_groups.fetch_add(1, Ordering::Relaxed);
        }
        self.linked_exts.fetch_add(1, Ordering::Relaxed);
    }

    fn removed(&self, group: GroupId, left: bool, right: bool) {
        let delta = match (left, right) {
            (true, true) => 1,
            (false, false) => -1,
            _ => 0,
        };
        let g = group.0 as usize;
        self.runs[g].fetch_add(delta, Ordering::Relaxed);
        self.total_runs.fetch_add(delta, Ordering::Relaxed);
        if self.linked[g].fetch_sub(1, Ordering::Relaxed) == 1 {
            self.active_groups.fetch_sub(1, Ordering::Relaxed);
        }
        self.linked_exts.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-device secondary tier context
pub struct Area {
    space: IndexSpace,
    geometry: Geometry,
    bitmap: ExtentBitmap,
    objects: ListTable,
    extents: ListTable,
    cache: ExtentCache,
    stored_exts: AtomicU32,
    group_exts: Box<[AtomicU32]>,
    ext_pages: Box<[AtomicU32]>,
    ext_bytes: Box<[AtomicU64]>,
    frag: Fragmentation,
}

impl Area {
    /// Create the area for one device
    pub fn new(config: &AreaConfig, cache_capacity: usize, groups: Arc<dyn GroupDirectory>) -> Result<Self> {
        if config.nr_extents == 0 || config.nr_objects == 0 || config.nr_groups < 2 {
            return Err(Error::InvalidArgument(format!(
                "area needs objects, extents and at least one group: {:?}",
                config
            )));
        }
        let space = IndexSpace::new(config.nr_objects, config.nr_extents, config.nr_groups);
        let geometry = Geometry::new(config.extent_shift);
        let nr_exts = config.nr_extents as usize;
        let capacity = if cache_capacity == 0 { nr_exts } else { cache_capacity };

        // Object lane: object LRU nodes plus one reverse-map anchor per extent.
        let objects = ListTable::new(space, 0..space.group_base(), groups.clone(), Lane::Objects);
        let extents = ListTable::new(space, space.extent_base()..space.group_base(), groups, Lane::Extents);

        info!(
            nr_objs = config.nr_objects,
            nr_exts = config.nr_extents,
            extent_size = geometry.extent_size(),
            cache_capacity = capacity,
            "Extent area created"
        );

        Ok(Self {
            space,
            geometry,
            bitmap: ExtentBitmap::new(nr_exts),
            objects,
            extents,
            cache: ExtentCache::new(geometry, capacity),
            stored_exts: AtomicU32::new(0),
            group_exts: (0..config.nr_groups).map(|_| AtomicU32::new(0)).collect(),
            ext_pages: (0..nr_exts).map(|_| AtomicU32::new(0)).collect(),
            ext_bytes: (0..nr_exts).map(|_| AtomicU64::new(0)).collect(),
            frag: Fragmentation::new(config.nr_groups as usize),
        })
    }

    pub fn space(&self) -> &IndexSpace {
        &self.space
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn cache(&self) -> &ExtentCache {
        &self.cache
    }

    /// Object lane: group object LRUs and per-extent reverse maps
    pub fn objects(&self) -> &ListTable {
        &self.objects
    }

    /// Extent lane: group extent LRUs
    pub fn extents(&self) -> &ListTable {
        &self.extents
    }

    pub fn nr_exts(&self) -> u32 {
        self.space.nr_exts()
    }

    /// Allocated extents, claimed or chained
    pub fn stored_extents(&self) -> u32 {
        self.stored_exts.load(Ordering::Acquire)
    }

    /// Population count of the bitmap
    pub fn allocated_bits(&self) -> usize {
        self.bitmap.count_ones()
    }

    pub fn is_allocated(&self, ext: ExtentId) -> bool {
        (ext.0 < self.nr_exts()) && self.bitmap.test(ext.0 as usize)
    }

    /// Extents currently owned by `group`
    pub fn group_extents(&self, group: GroupId) -> u32 {
        self.group_exts
            .get(group.0 as usize)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Sum of per-group extent counts
    pub fn owned_extents(&self) -> u64 {
        self.group_exts
            .iter()
            .map(|c| c.load(Ordering::Acquire) as u64)
            .sum()
    }

    pub fn owner(&self, ext: ExtentId) -> Result<GroupId> {
        self.extents.owner(self.space.extent(ext)?)
    }

    /// Claim a free extent for `group`
    pub fn allocate_extent(&self, group: GroupId) -> Result<ExtentId> {
        self.space.group(group)?;
        let bit = self
            .bitmap
            .claim()
            .ok_or_else(|| Error::OutOfSpace(format!("all {} extents allocated", self.nr_exts())))?;
        let ext = ExtentId(bit as u32);
        let idx = self.space.extent(ext)?;

        let previous = self.extents.owner(idx)?;
        if !previous.is_none() {
            error!(ext = ext.0, owner = previous.0, "Free extent still carries an owner");
            self.bitmap.test_and_clear(bit);
            return Err(Error::Busy(format!("{} owned by {}", ext, previous)));
        }

        self.extents.set_owner(idx, group)?;
        self.extents.try_claim(idx)?;
        self.ext_pages[bit].store(0, Ordering::Release);
        self.ext_bytes[bit].store(0, Ordering::Release);
        self.stored_exts.fetch_add(1, Ordering::AcqRel);
        self.group_exts[group.0 as usize].fetch_add(1, Ordering::AcqRel);

        debug!(ext = ext.0, group = group.0, "Extent allocated");
        Ok(ext)
    }

    /// Return an extent to the bitmap
    ///
    /// Contract violations (pinned cache entry, extent still chained, bit
    /// already clear) are logged and the extent is freed anyway.
    pub fn free_extent(&self, ext: ExtentId) -> Result<()> {
        let idx = self.space.extent(ext)?;

        if let Some(entry) = self.cache.supersede(ext) {
            if entry.pins() > 0 {
                error!(ext = ext.0, pins = entry.pins(), "Freeing extent with a pinned cache entry");
            }
        }

        let owner = self.extents.owner(idx)?;
        if !owner.is_none() && self.extents.is_linked(idx)? {
            error!(ext = ext.0, group = owner.0, "Freeing extent still on its group chain");
            self.unlink(ext, owner)?;
        }

        self.extents.set_owner(idx, GroupId::NONE)?;
        self.extents.try_claim(idx)?;
        self.ext_pages[ext.0 as usize].store(0, Ordering::Release);
        self.ext_bytes[ext.0 as usize].store(0, Ordering::Release);

        if self.bitmap.test_and_clear(ext.0 as usize) {
            self.stored_exts.fetch_sub(1, Ordering::AcqRel);
            if !owner.is_none() {
                self.group_exts[owner.0 as usize].fetch_sub(1, Ordering::AcqRel);
            }
        } else {
            warn!(ext = ext.0, "Freeing extent that was not allocated");
        }

        debug!(ext = ext.0, group = owner.0, "Extent freed");
        Ok(())
    }

    /// Claim a chained extent and take it off its owner's chain
    pub fn checkout_extent(&self, ext: ExtentId) -> Result<()> {
        let idx = self.space.extent(ext)?;
        if !self.extents.try_claim(idx)? {
            return Err(Error::Busy(format!("{} already checked out", ext)));
        }
        let owner = self.extents.owner(idx)?;
        if !owner.is_none() {
            self.unlink(ext, owner)?;
        }
        Ok(())
    }

    /// Append a claimed extent to its owner's chain and release the claim
    pub fn checkin_extent(&self, ext: ExtentId) -> Result<()> {
        let idx = self.space.extent(ext)?;
        let owner = self.extents.owner(idx)?;
        if !owner.is_none() {
            if let Err(e) = self.link(ext, owner) {
                warn!(ext = ext.0, group = owner.0, error = %e, "Owner chain unavailable at checkin");
            }
        }
        if !self.extents.set_ready(idx)? {
            warn!(ext = ext.0, "Checkin of extent that was not checked out");
        }
        Ok(())
    }

    /// Claim the coldest chained extent of `group` accepted by `filter`
    pub fn pick_extent(&self, group: GroupId, filter: ExtentFilter) -> Result<ExtentId> {
        let anchor = self.space.group(group)?;
        let picked = self.extents.with_chain(anchor, |chain| {
            // Claim before filtering: a claimed extent cannot gain new pins.
            let idx = chain.find(|idx| {
                let ext = ExtentId(idx - self.space.extent_base());
                if !self.extents.try_claim(idx).unwrap_or(false) {
                    return false;
                }
                if self.accepts(ext, filter) {
                    return true;
                }
                let _ = self.extents.set_ready(idx);
                false
            })?;
            let ext = ExtentId(idx - self.space.extent_base());
            self.unlink_locked(chain, ext, group);
            Some(ext)
        })?;
        picked.ok_or_else(|| Error::NotFound(format!("no eligible extent in {}", group)))
    }

    /// Extent ids on `group`'s chain, coldest first
    pub fn chain_extents(&self, group: GroupId) -> Result<Vec<ExtentId>> {
        let anchor = self.space.group(group)?;
        let base = self.space.extent_base();
        self.extents.with_chain(anchor, |chain| {
            chain
                .collect(usize::MAX)
                .into_iter()
                .map(|idx| ExtentId(idx - base))
                .collect()
        })
    }

    /// Length of `group`'s chain
    pub fn chain_len(&self, group: GroupId) -> Result<usize> {
        let anchor = self.space.group(group)?;
        self.extents.with_chain(anchor, |chain| chain.len())
    }

    /// Take every chained extent away from `group`
    ///
    /// The extents stay allocated and claimable but ownerless; they are freed
    /// once their last object is released.
    pub fn disown_extents(&self, group: GroupId) -> Result<usize> {
        let anchor = self.space.group(group)?;
        let base = self.space.extent_base();
        let disowned = self.extents.with_chain(anchor, |chain| {
            let mut n = 0;
            while let Some(idx) = chain.first() {
                let ext = ExtentId(idx - base);
                self.unlink_locked(chain, ext, group);
                if let Err(e) = self.extents.set_owner(idx, GroupId::NONE) {
                    error!(ext = ext.0, error = %e, "Failed to clear extent owner");
                }
                self.group_exts[group.0 as usize].fetch_sub(1, Ordering::AcqRel);
                n += 1;
            }
            n
        })?;
        if disowned > 0 {
            info!(group = group.0, disowned, "Group extents disowned");
        }
        Ok(disowned)
    }

    fn accepts(&self, ext: ExtentId, filter: ExtentFilter) -> bool {
        match filter {
            ExtentFilter::Any => true,
            ExtentFilter::NotCached => !self.cache.lookup(ext),
            ExtentFilter::Evictable { max_bytes } => {
                self.cache.pins(ext) == Some(0) && self.stored_bytes(ext) <= max_bytes
            }
        }
    }

    fn link(&self, ext: ExtentId, group: GroupId) -> Result<()> {
        let idx = self.space.extent(ext)?;
        let anchor = self.space.group(group)?;
        self.extents.with_chain(anchor, |chain| {
            if chain.push_back(idx) {
                let (left, right) = self.neighbours(ext, group);
                self.frag.inserted(group, left, right);
            }
        })
    }

    fn unlink(&self, ext: ExtentId, group: GroupId) -> Result<()> {
        let anchor = self.space.group(group)?;
        self.extents
            .with_chain(anchor, |chain| self.unlink_locked(chain, ext, group))
    }

    fn unlink_locked(&self, chain: &Chain<'_>, ext: ExtentId, group: GroupId) {
        if chain.remove(self.space.extent_base() + ext.0) {
            let (left, right) = self.neighbours(ext, group);
            self.frag.removed(group, left, right);
        }
    }

    /// Whether each id-neighbour of `ext` is chained in `group`
    fn neighbours(&self, ext: ExtentId, group: GroupId) -> (bool, bool) {
        let chained = |id: Option<u32>| {
            id.and_then(|id| self.space.extent(ExtentId(id)).ok())
                .map_or(false, |idx| {
                    self.extents.owner(idx).map_or(false, |o| o == group)
                        && self.extents.is_linked(idx).unwrap_or(false)
                })
        };
        (chained(ext.0.checked_sub(1)), chained(ext.0.checked_add(1)))
    }

    /// Run count for one group
    pub fn group_fragments(&self, group: GroupId) -> i64 {
        self.frag
            .runs
            .get(group.0 as usize)
            .map_or(0, |r| r.load(Ordering::Relaxed))
    }

    pub fn frag_stats(&self) -> FragStats {
        FragStats {
            runs: self.frag.total_runs.load(Ordering::Relaxed),
            groups: self.frag.active_groups.load(Ordering::Relaxed),
            extents: self.frag.linked_exts.load(Ordering::Relaxed),
        }
    }

    /// Account `pages` objects totalling `bytes` into `ext`
    pub fn add_stored(&self, ext: ExtentId, pages: u32, bytes: u64) {
        if let Some(c) = self.ext_pages.get(ext.0 as usize) {
            c.fetch_add(pages, Ordering::AcqRel);
            self.ext_bytes[ext.0 as usize].fetch_add(bytes, Ordering::AcqRel);
        }
    }

    /// Remove accounting for objects leaving `ext`; returns the pages left
    pub fn sub_stored(&self, ext: ExtentId, pages: u32, bytes: u64) -> u32 {
        let Some(c) = self.ext_pages.get(ext.0 as usize) else {
            return 0;
        };
        let before = c
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(pages)))
            .unwrap_or(0);
        if before < pages {
            error!(ext = ext.0, before, pages, "Extent page count underflow");
        }
        let _ = self.ext_bytes[ext.0 as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(bytes)));
        before.saturating_sub(pages)
    }

    pub fn stored_pages(&self, ext: ExtentId) -> u32 {
        self.ext_pages
            .get(ext.0 as usize)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn stored_bytes(&self, ext: ExtentId) -> u64 {
        self.ext_bytes
            .get(ext.0 as usize)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }
}

impl Drop for Area {
    fn drop(&mut self) {
        info!(
            stored = self.stored_exts.load(Ordering::Relaxed),
            cached = self.cache.len(),
            "Extent area destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::group::GroupRegistry;
    use crate::tier::pages::ExtentPages;

    fn area(nr_exts: u32) -> Result<(Area, Arc<GroupRegistry>)> {
        let groups = Arc::new(GroupRegistry::new());
        let config = AreaConfig {
            nr_objects: 64,
            nr_extents: nr_exts,
            extent_shift: 13,
            nr_groups: 8,
        };
        let area = Area::new(&config, 0, groups.clone())?;
        Ok((area, groups))
    }

    fn attach(area: &Area, groups: &GroupRegistry, id: u16) -> Result<GroupId> {
        let group = GroupId(id);
        groups.create(group, area.space().group(group)?)?;
        Ok(group)
    }

    #[test]
    fn test_allocate_and_free_counts() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 1)?;

        let a = area.allocate_extent(g)?;
        let b = area.allocate_extent(g)?;
        assert_ne!(a, b);
        assert_eq!(area.stored_extents(), 2);
        assert_eq!(area.group_extents(g), 2);
        assert_eq!(area.owner(a)?, g);

        area.free_extent(a)?;
        assert_eq!(area.stored_extents(), 1);
        assert_eq!(area.allocated_bits(), 1);
        assert_eq!(area.owner(a)?, GroupId::NONE);
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> Result<()> {
        let (area, groups) = area(2)?;
        let g = attach(&area, &groups, 1)?;
        area.allocate_extent(g)?;
        area.allocate_extent(g)?;
        assert!(matches!(area.allocate_extent(g), Err(Error::OutOfSpace(_))));
        Ok(())
    }

    #[test]
    fn test_free_unallocated_is_harmless() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 1)?;
        area.free_extent(ExtentId(2))?;
        assert_eq!(area.stored_extents(), 0);

        let ids: Vec<_> = (0..4).map(|_| area.allocate_extent(g)).collect::<Result<_>>()?;
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
        assert_eq!(area.stored_extents() as usize, area.allocated_bits());
        Ok(())
    }

    #[test]
    fn test_invalid_group() -> Result<()> {
        let (area, _) = area(4)?;
        assert!(matches!(area.allocate_extent(GroupId::NONE), Err(Error::InvalidArgument(_))));
        assert!(matches!(area.allocate_extent(GroupId(8)), Err(Error::InvalidArgument(_))));
        assert_eq!(area.stored_extents(), 0);
        Ok(())
    }

    #[test]
    fn test_checkout_is_exclusive() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 1)?;
        let ext = area.allocate_extent(g)?;

        assert!(area.checkout_extent(ext).unwrap_err().is_busy());
        area.checkin_extent(ext)?;
        area.checkout_extent(ext)?;
        assert!(area.checkout_extent(ext).unwrap_err().is_busy());
        area.checkin_extent(ext)?;
        assert_eq!(area.chain_extents(g)?, vec![ext]);
        Ok(())
    }

    #[test]
    fn test_pick_in_insertion_order() -> Result<()> {
        let (area, groups) = area(8)?;
        let g = attach(&area, &groups, 2)?;
        let ids: Vec<_> = (0..5).map(|_| area.allocate_extent(g)).collect::<Result<_>>()?;
        for &ext in ids.iter().rev() {
            area.checkin_extent(ext)?;
        }

        let mut picked = Vec::new();
        for _ in 0..5 {
            picked.push(area.pick_extent(g, ExtentFilter::Any)?);
        }
        let expected: Vec<_> = ids.iter().rev().copied().collect();
        assert_eq!(picked, expected);
        assert!(area.pick_extent(g, ExtentFilter::Any).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_pick_filters() -> Result<()> {
        let (area, groups) = area(8)?;
        let g = attach(&area, &groups, 1)?;
        let a = area.allocate_extent(g)?;
        let b = area.allocate_extent(g)?;
        area.add_stored(a, 2, 100);
        area.add_stored(b, 2, 9000);
        area.cache().insert(a, ExtentPages::new(2), false)?;
        area.cache().insert(b, ExtentPages::new(2), false)?;
        area.checkin_extent(a)?;
        area.checkin_extent(b)?;

        assert!(area.pick_extent(g, ExtentFilter::NotCached).unwrap_err().is_not_found());
        let picked = area.pick_extent(g, ExtentFilter::Evictable { max_bytes: 4096 })?;
        assert_eq!(picked, a);
        assert_eq!(area.chain_extents(g)?, vec![b]);
        Ok(())
    }

    #[test]
    fn test_pinned_extent_not_evictable() -> Result<()> {
        let (area, groups) = area(8)?;
        let g = attach(&area, &groups, 1)?;
        let ext = area.allocate_extent(g)?;
        area.add_stored(ext, 1, 100);
        area.cache().insert(ext, ExtentPages::new(2), true)?;
        area.checkin_extent(ext)?;

        let evictable = ExtentFilter::Evictable { max_bytes: 4096 };
        assert!(area.pick_extent(g, evictable).unwrap_err().is_not_found());
        // The rejected extent stays chained and claimable.
        assert_eq!(area.chain_extents(g)?, vec![ext]);
        area.checkout_extent(ext)?;
        area.checkin_extent(ext)?;

        assert!(area.cache().unpin(ext));
        assert_eq!(area.pick_extent(g, evictable)?, ext);
        Ok(())
    }

    #[test]
    fn test_fragmentation_runs() -> Result<()> {
        let (area, groups) = area(10)?;
        let g = attach(&area, &groups, 1)?;
        let ids: Vec<_> = (0..6).map(|_| area.allocate_extent(g)).collect::<Result<_>>()?;
        assert_eq!(ids[3], ExtentId(3));

        area.checkin_extent(ExtentId(3))?;
        area.checkin_extent(ExtentId(5))?;
        assert_eq!(area.group_fragments(g), 2);

        area.checkin_extent(ExtentId(4))?;
        assert_eq!(area.group_fragments(g), 1);

        area.checkout_extent(ExtentId(4))?;
        area.free_extent(ExtentId(4))?;
        assert_eq!(area.group_fragments(g), 2);
        assert_eq!(area.frag_stats(), FragStats { runs: 2, groups: 1, extents: 2 });
        Ok(())
    }

    #[test]
    fn test_free_chained_extent_unlinks() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 1)?;
        let ext = area.allocate_extent(g)?;
        area.checkin_extent(ext)?;
        area.free_extent(ext)?;
        assert!(area.chain_extents(g)?.is_empty());
        assert_eq!(area.frag_stats(), FragStats::default());
        Ok(())
    }

    #[test]
    fn test_disown_extents() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 3)?;
        for _ in 0..3 {
            let ext = area.allocate_extent(g)?;
            area.checkin_extent(ext)?;
        }
        assert_eq!(area.disown_extents(g)?, 3);
        assert_eq!(area.group_extents(g), 0);
        assert_eq!(area.stored_extents(), 3);
        assert_eq!(area.frag_stats().extents, 0);
        Ok(())
    }

    #[test]
    fn test_stored_accounting() -> Result<()> {
        let (area, groups) = area(4)?;
        let g = attach(&area, &groups, 1)?;
        let ext = area.allocate_extent(g)?;
        area.add_stored(ext, 3, 3000);
        assert_eq!(area.sub_stored(ext, 1, 1000), 2);
        assert_eq!(area.stored_bytes(ext), 2000);
        assert_eq!(area.sub_stored(ext, 2, 2000), 0);
        Ok(())
    }
}
