//! Extent lifecycle orchestration
//!
//! The manager moves objects between the primary store and the tier:
//!
//! ```text
//!            create                 register(true)
//!   FREE ───────────▶ FILLING ─────────────────────▶ COMMITTED
//!    ▲                  │ register(false)               │
//!    │                  ▼ / exception(ReclaimIn)         │ find_by_extent_id
//!    └──────────────── FREE                             │ find_by_group
//!    ▲                                                  ▼
//!    │          destroy (drained, empty)            READING
//!    └──────────────────────────────────────────────────┤
//!                  destroy (cached or partial) ─▶ COMMITTED
//! ```
//!
//! Extent I/O itself belongs to the caller: `create` hands out the filled
//! pages to write, `find_*` hand out an empty buffer to read into. An extent
//! handed out in an [`ExtentIo`] is claimed until it is passed back to
//! `register`, `destroy` or `exception`.

use super::area::{Area, ExtentFilter};
use super::compression;
use super::group::{GroupCounters, GroupDirectory, GroupRecord, GroupRegistry, GroupStats};
use super::index::{ExtentId, GroupId, ObjectId, PAGE_SIZE};
use super::pages::ExtentPages;
use super::stats::{self, StatsSnapshot, TierStats};
use super::store::{ObjectFlags, ObjectMeta, PrimaryStore};
use crate::config::{TierConfig, CACHE_LEVEL_BATCH_OUT, CACHE_LEVEL_FAULT_OUT, CACHE_LEVEL_RECLAIM_IN};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Path an extent operation belongs to; selects the cache admission bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Objects written from the primary store into the tier
    ReclaimIn,
    /// A single object faulted back
    FaultOut,
    /// A whole group faulted back
    BatchOut,
}

impl Scenario {
    pub fn cache_bit(self) -> u32 {
        match self {
            Scenario::ReclaimIn => CACHE_LEVEL_RECLAIM_IN,
            Scenario::FaultOut => CACHE_LEVEL_FAULT_OUT,
            Scenario::BatchOut => CACHE_LEVEL_BATCH_OUT,
        }
    }
}

/// An object packed into an extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObject {
    pub obj: ObjectId,
    /// Byte offset within the extent
    pub offset: usize,
    pub size: u32,
}

/// A claimed extent in flight between the manager and the caller's device
#[derive(Debug)]
pub struct ExtentIo {
    ext: ExtentId,
    group: GroupId,
    pages: ExtentPages,
    objects: Vec<PackedObject>,
    batched: Vec<ObjectId>,
}

impl ExtentIo {
    fn new(ext: ExtentId, group: GroupId, nr_pages: usize) -> Self {
        Self {
            ext,
            group,
            pages: ExtentPages::new(nr_pages),
            objects: Vec::new(),
            batched: Vec::new(),
        }
    }

    pub fn extent(&self) -> ExtentId {
        self.ext
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn pages(&self) -> &ExtentPages {
        &self.pages
    }

    /// Buffer the caller fills when reading the extent back
    pub fn pages_mut(&mut self) -> &mut ExtentPages {
        &mut self.pages
    }

    /// Objects packed by `create`; empty on the read paths
    pub fn objects(&self) -> &[PackedObject] {
        &self.objects
    }

    /// Objects marked for a batch fault by `find_by_group`
    pub fn batched(&self) -> &[ObjectId] {
        &self.batched
    }

    pub fn bytes_used(&self) -> usize {
        self.objects.iter().map(|p| p.size as usize).sum()
    }
}

/// Result of locating an extent for a single-object fault
#[derive(Debug)]
pub enum FaultIn {
    /// The extent is cached and now pinned; finish with [`Manager::cache_out`]
    Cached(ExtentId),
    /// The extent must be read into the buffer, then passed to `destroy`
    Io(ExtentIo),
}

enum Pack {
    Packed(u32),
    Skip,
    Full,
}

/// Secondary tier manager over a primary store `S`
pub struct Manager<S: PrimaryStore> {
    config: TierConfig,
    area: Area,
    groups: Arc<GroupRegistry>,
    store: Arc<S>,
    cache_level: AtomicU32,
    stats: TierStats,
}

impl<S: PrimaryStore> Manager<S> {
    /// Attach a tier to `store`
    pub fn new(config: TierConfig, store: Arc<S>) -> Result<Self> {
        config.validate()?;
        if store.capacity() < config.area.nr_objects {
            return Err(Error::InvalidArgument(format!(
                "store holds {} objects, area needs {}",
                store.capacity(),
                config.area.nr_objects
            )));
        }
        stats::init_metrics();
        let groups = Arc::new(GroupRegistry::new());
        let directory: Arc<dyn GroupDirectory> = groups.clone();
        let area = Area::new(&config.area, config.cache.max_extents, directory)?;
        let level = config.cache.level();

        info!(codec = ?config.codec, cache_level = level, "Tier manager attached");

        Ok(Self {
            config,
            area,
            groups,
            store,
            cache_level: AtomicU32::new(level),
            stats: TierStats::default(),
        })
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn area(&self) -> &Area {
        &self.area
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    // ---- groups ---------------------------------------------------------

    /// Register a group and initialise its anchors
    pub fn attach_group(&self, group: GroupId) -> Result<Arc<GroupRecord>> {
        let anchor = self.area.space().group(group)?;
        let record = self.groups.create(group, anchor)?;
        info!(group = group.0, "Group attached");
        Ok(record)
    }

    /// Disown every object and extent of `group` and drop its record
    pub fn detach_group(&self, group: GroupId) -> Result<()> {
        let anchor = self.area.space().group(group)?;
        if self.groups.resolve(group).is_none() {
            return Err(Error::NotFound(format!("{} not attached", group)));
        }

        let mut cleared = 0usize;
        loop {
            let next = self.area.objects().with_chain(anchor, |chain| {
                let idx = chain.first()?;
                chain.remove(idx);
                Some(idx)
            })?;
            let Some(idx) = next else { break };
            self.store.with_object(ObjectId(idx), |meta| {
                meta.flags.insert(ObjectFlags::GROUP_CLEARED);
                meta.group = GroupId::NONE;
            })?;
            cleared += 1;
        }

        let disowned = self.area.disown_extents(group)?;
        self.groups.remove(group);
        info!(group = group.0, cleared, disowned, "Group detached");
        Ok(())
    }

    pub fn group_stats(&self, group: GroupId) -> Option<GroupStats> {
        self.groups.resolve(group).map(|r| r.stats())
    }

    fn account(&self, group: GroupId, f: impl FnOnce(&GroupCounters)) {
        if let Some(record) = self.groups.resolve(group) {
            f(record.counters());
        }
    }

    // ---- primary store objects -------------------------------------------

    /// Store one page for `group` and put it on the group's object LRU
    pub fn write_page(&self, obj: ObjectId, group: GroupId, page: &[u8]) -> Result<()> {
        let idx = self.area.space().object(obj)?;
        let anchor = self.area.space().group(group)?;
        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidArgument(format!("page of {} bytes", page.len())));
        }
        if self.groups.resolve(group).is_none() {
            return Err(Error::NotFound(format!("{} not attached", group)));
        }
        self.release_object(obj)?;

        if let Some(&fill) = page.first().filter(|&&b| page.iter().all(|&x| x == b)) {
            return self.store.with_object(obj, |meta| {
                *meta = ObjectMeta {
                    handle: fill as u64,
                    size: 0,
                    flags: ObjectFlags::SAME,
                    group,
                };
            });
        }

        let compressed = compression::compress(page, self.config.codec)?;
        let (payload, flags) = if compressed.len() >= PAGE_SIZE {
            (page, ObjectFlags::HUGE)
        } else {
            (&compressed[..], ObjectFlags::empty())
        };
        let handle = self.store.alloc(payload)?;
        let size = payload.len() as u32;

        self.store.with_object(obj, |meta| {
            *meta = ObjectMeta {
                handle,
                size,
                flags,
                group,
            };
            if self.area.objects().add(idx, anchor)? {
                Ok(())
            } else {
                error!(obj = obj.0, group = group.0, "Object already linked, not tracked");
                self.store.free(handle);
                *meta = ObjectMeta::default();
                Err(Error::AlreadyExists(format!("{} already linked", obj)))
            }
        })??;
        self.account(group, |c| GroupCounters::add(&c.primary_bytes, size as i64));
        Ok(())
    }

    /// Put a primary-store object on its group's object LRU
    pub fn track_object(&self, obj: ObjectId) -> Result<()> {
        let idx = self.area.space().object(obj)?;
        let (group, size) = self.store.with_object(obj, |meta| -> Result<(GroupId, u32)> {
            let unavailable = ObjectFlags::IN_TIER | ObjectFlags::SAME | ObjectFlags::WRITE_IN_PROGRESS;
            if meta.is_empty() || meta.flags.intersects(unavailable) {
                return Err(Error::InvalidArgument(format!("{} is not a primary object", obj)));
            }
            let anchor = self.area.space().group(meta.group)?;
            if !self.area.objects().add(idx, anchor)? {
                return Err(Error::AlreadyExists(format!("{} already tracked", obj)));
            }
            Ok((meta.group, meta.size))
        })??;
        self.account(group, |c| GroupCounters::add(&c.primary_bytes, size as i64));
        Ok(())
    }

    /// Drop an object wherever it lives
    ///
    /// Releasing the last object of an extent frees the extent.
    pub fn release_object(&self, obj: ObjectId) -> Result<()> {
        let idx = self.area.space().object(obj)?;
        let emptied = self.store.with_object(obj, |meta| -> Result<Option<ExtentId>> {
            let mut emptied = None;
            let size = meta.size;
            if meta.flags.contains(ObjectFlags::SAME) || meta.is_empty() {
                // nothing stored
            } else if meta.flags.contains(ObjectFlags::IN_TIER) {
                let ext = self.area.geometry().extent_of(meta.handle);
                let ext_anchor = self.area.space().extent(ext)?;
                self.area.objects().del(idx, ext_anchor)?;
                if self.area.sub_stored(ext, 1, size as u64) == 0 {
                    emptied = Some(ext);
                }
                self.account(meta.group, |c| {
                    GroupCounters::add(&c.tier_pages, -1);
                    GroupCounters::add(&c.tier_bytes, -(size as i64));
                });
            } else {
                if !meta.flags.contains(ObjectFlags::WRITE_IN_PROGRESS) {
                    if let Ok(anchor) = self.area.space().group(meta.group) {
                        if self.groups.resolve(meta.group).is_some() {
                            self.area.objects().del(idx, anchor)?;
                        }
                    }
                }
                self.store.free(meta.handle);
                self.account(meta.group, |c| GroupCounters::add(&c.primary_bytes, -(size as i64)));
            }
            *meta = ObjectMeta::default();
            Ok(emptied)
        })??;

        if let Some(ext) = emptied {
            self.notify_free(ext);
        }
        Ok(())
    }

    /// Read a page back, from the primary store or a cached extent
    pub fn read_page(&self, obj: ObjectId) -> Result<Vec<u8>> {
        self.area.space().object(obj)?;
        let meta = self.store.with_object(obj, |meta| *meta)?;
        if meta.flags.contains(ObjectFlags::SAME) {
            return Ok(vec![meta.handle as u8; PAGE_SIZE]);
        }
        if meta.is_empty() {
            return Err(Error::NotFound(format!("{} is empty", obj)));
        }
        let mut page = vec![0u8; PAGE_SIZE];
        if meta.flags.contains(ObjectFlags::IN_TIER) {
            self.cache_decompress(obj, &mut page)?;
        } else {
            let payload = self.store.load(meta.handle)?;
            self.decode(&meta, &payload, &mut page)?;
        }
        Ok(page)
    }

    fn decode(&self, meta: &ObjectMeta, payload: &[u8], page: &mut [u8]) -> Result<()> {
        if meta.flags.contains(ObjectFlags::HUGE) {
            if payload.len() != page.len() {
                return Err(Error::Codec(format!("huge object of {} bytes", payload.len())));
            }
            page.copy_from_slice(payload);
            Ok(())
        } else {
            compression::decompress_into(payload, self.config.codec, page)
        }
    }

    // ---- reclaim in ------------------------------------------------------

    /// Allocate an extent for `group` and pack its coldest objects into it
    pub fn create(&self, group: GroupId) -> Result<ExtentIo> {
        let anchor = self.area.space().group(group)?;
        if self.groups.resolve(group).is_none() {
            return Err(Error::NotFound(format!("{} not attached", group)));
        }
        self.check_watermark();

        let ext = self.area.allocate_extent(group).map_err(|e| {
            if matches!(e, Error::OutOfSpace(_)) {
                self.stats.record_alloc_failure();
            }
            e
        })?;

        let geometry = *self.area.geometry();
        let capacity = geometry.extent_size();
        let max_objects = geometry.max_objects();
        let mut io = ExtentIo::new(ext, group, geometry.pages_per_extent());
        let mut used = 0usize;

        let walk = self.area.objects().with_chain(anchor, |chain| {
            chain.for_each(|idx| {
                if io.objects.len() >= max_objects {
                    return ControlFlow::Break(());
                }
                let obj = ObjectId(idx);
                let pages = &mut io.pages;
                let outcome = self
                    .store
                    .try_with_object(obj, |meta| self.pack_object(meta, group, pages, used, capacity));
                match outcome {
                    Ok(Some(Pack::Packed(size))) => {
                        chain.remove(idx);
                        io.objects.push(PackedObject {
                            obj,
                            offset: used,
                            size,
                        });
                        used += size as usize;
                        ControlFlow::Continue(())
                    }
                    Ok(Some(Pack::Full)) => ControlFlow::Break(()),
                    Ok(Some(Pack::Skip)) | Ok(None) => ControlFlow::Continue(()),
                    Err(e) => {
                        warn!(obj = obj.0, error = %e, "Skipping object during extent fill");
                        ControlFlow::Continue(())
                    }
                }
            })
        });

        if let Err(e) = walk {
            self.area.free_extent(ext)?;
            return Err(e);
        }
        if io.objects.is_empty() {
            self.area.free_extent(ext)?;
            return Err(Error::NoEligibleObjects(format!("nothing to write for {}", group)));
        }

        debug!(ext = ext.0, group = group.0, objects = io.objects.len(), bytes = used, "Extent filled");
        Ok(io)
    }

    fn pack_object(
        &self,
        meta: &mut ObjectMeta,
        group: GroupId,
        pages: &mut ExtentPages,
        used: usize,
        capacity: usize,
    ) -> Pack {
        let busy = ObjectFlags::IN_TIER
            | ObjectFlags::WRITE_IN_PROGRESS
            | ObjectFlags::BATCHING_OUT
            | ObjectFlags::SAME;
        if meta.flags.intersects(busy) || meta.group != group || meta.size == 0 {
            return Pack::Skip;
        }
        if used + meta.size as usize > capacity {
            return Pack::Full;
        }
        let copied = self
            .store
            .load(meta.handle)
            .and_then(|payload| pages.write_at(used, &payload));
        if let Err(e) = copied {
            warn!(handle = meta.handle, error = %e, "Object payload unavailable");
            return Pack::Skip;
        }
        meta.flags.insert(ObjectFlags::WRITE_IN_PROGRESS);
        Pack::Packed(meta.size)
    }

    /// Compact down to the low watermark once the high one is reached
    fn check_watermark(&self) {
        let total = self.area.nr_exts();
        let high = self.config.watermark.high_extents(total);
        let stored = self.area.stored_extents();
        if high == 0 || stored < high {
            return;
        }
        let target = stored.saturating_sub(self.config.watermark.low_extents(total));
        let moved = self.compact(target as usize);
        info!(stored, high, target, moved, "High watermark compaction");
    }

    /// Finish a `create`: commit on success, roll back on failure
    pub fn register(&self, io: ExtentIo, written: bool) -> Result<()> {
        if !written {
            return self.abort_reclaim(io);
        }
        let ExtentIo {
            ext,
            group,
            pages,
            objects,
            ..
        } = io;

        if self.cache_level() & CACHE_LEVEL_RECLAIM_IN != 0 {
            let cache = self.area.cache();
            let inserted = match cache.try_insert(ext, pages, false) {
                Err((Error::AlreadyExists(_), pages)) => {
                    error!(ext = ext.0, "Fresh extent already cached, replacing stale entry");
                    cache.supersede(ext);
                    cache.insert(ext, pages, false)
                }
                other => other.map_err(|(e, _)| e),
            };
            if let Err(e) = inserted {
                debug!(ext = ext.0, error = %e, "Extent not cached on write");
            }
        } else if self.area.cache().supersede(ext).is_some() {
            error!(ext = ext.0, "Dropped stale cache entry of a fresh extent");
        }

        let ext_anchor = self.area.space().extent(ext)?;
        let mut moved = 0u64;
        let mut bytes = 0u64;
        for packed in &objects {
            let outcome = self.store.with_object(packed.obj, |meta| -> Result<bool> {
                if !meta.flags.contains(ObjectFlags::WRITE_IN_PROGRESS) {
                    return Ok(false);
                }
                self.store.free(meta.handle);
                meta.handle = self.area.geometry().addr(ext, packed.offset);
                meta.flags.remove(ObjectFlags::WRITE_IN_PROGRESS | ObjectFlags::FROM_TIER);
                meta.flags.insert(ObjectFlags::IN_TIER);
                self.area.add_stored(ext, 1, packed.size as u64);
                self.area.objects().add(packed.obj.0, ext_anchor)?;
                Ok(true)
            });
            match outcome {
                Ok(Ok(true)) => {
                    moved += 1;
                    bytes += packed.size as u64;
                }
                Ok(Ok(false)) => debug!(obj = packed.obj.0, "Object released during write"),
                Ok(Err(e)) | Err(e) => error!(obj = packed.obj.0, error = %e, "Failed to commit object"),
            }
        }

        self.account(group, |c| {
            GroupCounters::add(&c.tier_pages, moved as i64);
            GroupCounters::add(&c.tier_bytes, bytes as i64);
            GroupCounters::add(&c.primary_bytes, -(bytes as i64));
            c.reclaimed_extents.fetch_add(1, Ordering::Relaxed);
        });
        self.stats.record_reclaim_in(moved, bytes);
        debug!(ext = ext.0, group = group.0, moved, bytes, "Extent committed");
        self.put_extent(ext);
        Ok(())
    }

    fn abort_reclaim(&self, io: ExtentIo) -> Result<()> {
        let anchor = self.area.space().group(io.group)?;
        let tracked = self.groups.resolve(io.group).is_some();
        for packed in &io.objects {
            let outcome = self.store.with_object(packed.obj, |meta| -> Result<()> {
                if !meta.flags.contains(ObjectFlags::WRITE_IN_PROGRESS) {
                    return Ok(());
                }
                meta.flags.remove(ObjectFlags::WRITE_IN_PROGRESS);
                if tracked && meta.group == io.group {
                    self.area.objects().add(packed.obj.0, anchor)?;
                }
                Ok(())
            });
            if let Ok(Err(e)) | Err(e) = outcome {
                error!(obj = packed.obj.0, error = %e, "Failed to restore object");
            }
        }
        debug!(ext = io.ext.0, objects = io.objects.len(), "Extent write discarded");
        self.area.free_extent(io.ext)
    }

    // ---- fault out -------------------------------------------------------

    /// Claim the extent behind a tier address for a single-object fault
    pub fn find_by_extent_id(&self, addr: u64) -> Result<FaultIn> {
        let ext = self.area.geometry().extent_of(addr);
        self.area.space().extent(ext)?;
        if !self.area.is_allocated(ext) {
            return Err(Error::NotFound(format!("{} not allocated", ext)));
        }
        self.area.checkout_extent(ext)?;

        if self.area.cache().pin(ext) {
            self.area.checkin_extent(ext)?;
            debug!(ext = ext.0, "Fault served from cache");
            return Ok(FaultIn::Cached(ext));
        }

        let group = self.area.owner(ext)?;
        self.account(group, |c| {
            c.faulted_extents.fetch_add(1, Ordering::Relaxed);
        });
        self.stats.record_fault_out();
        Ok(FaultIn::Io(ExtentIo::new(
            ext,
            group,
            self.area.geometry().pages_per_extent(),
        )))
    }

    /// Claim the coldest uncached extent of `group` for a batch fault
    pub fn find_by_group(&self, group: GroupId) -> Result<ExtentIo> {
        let ext = self.area.pick_extent(group, ExtentFilter::NotCached)?;
        let mut io = ExtentIo::new(ext, group, self.area.geometry().pages_per_extent());
        io.batched = match self.mark_batching(ext) {
            Ok(batched) => batched,
            Err(e) => {
                self.put_extent(ext);
                return Err(e);
            }
        };
        self.account(group, |c| {
            c.faulted_extents.fetch_add(1, Ordering::Relaxed);
        });
        self.stats.record_batch_out();
        Ok(io)
    }

    /// Flag every object still backed by `ext` as part of a batch fault
    fn mark_batching(&self, ext: ExtentId) -> Result<Vec<ObjectId>> {
        let anchor = self.area.space().extent(ext)?;
        let members = self
            .area
            .objects()
            .with_chain(anchor, |chain| chain.collect(usize::MAX))?;
        let mut batched = Vec::with_capacity(members.len());
        for idx in members {
            let obj = ObjectId(idx);
            let marked = self.store.with_object(obj, |meta| {
                let here = meta.flags.contains(ObjectFlags::IN_TIER)
                    && self.area.geometry().extent_of(meta.handle) == ext;
                if here {
                    meta.flags.insert(ObjectFlags::BATCHING_OUT);
                }
                here
            })?;
            if marked {
                batched.push(obj);
            }
        }
        Ok(batched)
    }

    /// Drop the batch-fault mark from objects that stayed in the tier
    fn clear_batching(&self, batched: &[ObjectId]) {
        for &obj in batched {
            if let Err(e) = self
                .store
                .with_object(obj, |meta| meta.flags.remove(ObjectFlags::BATCHING_OUT))
            {
                error!(obj = obj.0, error = %e, "Failed to clear batch mark");
            }
        }
    }

    /// Finish a read: cache the extent or drain it into the primary store
    pub fn destroy(&self, io: ExtentIo, scenario: Scenario) -> Result<()> {
        let ExtentIo { ext, pages, batched, .. } = io;

        let pages = if self.cache_level() & scenario.cache_bit() != 0 {
            let pin = scenario == Scenario::FaultOut;
            match self.area.cache().try_insert(ext, pages, pin) {
                Ok(()) => None,
                Err((Error::AlreadyExists(_), _)) if !pin || self.area.cache().pin(ext) => None,
                Err((e, pages)) => {
                    debug!(ext = ext.0, error = %e, "Extent not cached on read");
                    Some(pages)
                }
            }
        } else {
            Some(pages)
        };

        let drained = match &pages {
            Some(pages) => self.drain_extent(ext, pages, scenario == Scenario::BatchOut),
            None => Ok(0),
        };
        self.clear_batching(&batched);
        self.put_extent(ext);
        let drained = drained?;
        debug!(ext = ext.0, ?scenario, drained, "Extent read finished");
        Ok(())
    }

    /// Abort an in-flight extent operation
    pub fn exception(&self, scenario: Scenario, io: ExtentIo) -> Result<()> {
        self.stats.record_exception();
        warn!(ext = io.ext.0, ?scenario, "Extent operation aborted");
        match scenario {
            Scenario::ReclaimIn => self.abort_reclaim(io),
            Scenario::FaultOut | Scenario::BatchOut => {
                self.clear_batching(&io.batched);
                self.put_extent(io.ext);
                Ok(())
            }
        }
    }

    /// Move one object of a cached extent back to the primary store
    ///
    /// `pinned` is the extent a fault pinned for this read. Its pin is
    /// released whatever the outcome, including when the object already left
    /// the tier.
    pub fn cache_out(&self, obj: ObjectId, pinned: Option<ExtentId>) -> Result<()> {
        let outcome = self.area.space().object(obj).and_then(|idx| {
            self.store.with_object(obj, |meta| -> Result<(ExtentId, u32)> {
                if !meta.flags.contains(ObjectFlags::IN_TIER) {
                    return Err(Error::NotFound(format!("{} is not in the tier", obj)));
                }
                if meta.flags.contains(ObjectFlags::BATCHING_OUT) {
                    return Err(Error::Busy(format!("{} is being batched out", obj)));
                }
                let ext = self.area.geometry().extent_of(meta.handle);
                let entry = self
                    .area
                    .cache()
                    .get(ext)
                    .ok_or_else(|| Error::NotFound(format!("{} not cached", ext)))?;
                let remaining = self.pull_object(idx, meta, ext, entry.pages())?;
                Ok((ext, remaining))
            })?
        });

        if let Some(ext) = pinned {
            self.area.cache().unpin(ext);
        }
        let (ext, remaining) = outcome?;
        self.stats.record_cache_out();
        if remaining == 0 {
            self.notify_free(ext);
        }
        Ok(())
    }

    /// Decompress a tier object straight from its cached extent
    pub fn cache_decompress(&self, obj: ObjectId, page: &mut [u8]) -> Result<()> {
        self.store.with_object(obj, |meta| {
            if !meta.flags.contains(ObjectFlags::IN_TIER) {
                return Err(Error::InvalidArgument(format!("{} is not in the tier", obj)));
            }
            let geometry = self.area.geometry();
            let ext = geometry.extent_of(meta.handle);
            let entry = self
                .area
                .cache()
                .get(ext)
                .ok_or_else(|| Error::NotFound(format!("{} not cached", ext)))?;
            let mut payload = vec![0u8; meta.size as usize];
            entry.pages().read_at(geometry.offset_of(meta.handle), &mut payload)?;
            self.decode(meta, &payload, page)
        })?
    }

    /// Move a tier object into the primary store, reading it from `src`
    ///
    /// Called with the object lock held. Returns the pages left in `ext`.
    fn pull_object(&self, idx: u32, meta: &mut ObjectMeta, ext: ExtentId, src: &ExtentPages) -> Result<u32> {
        let geometry = self.area.geometry();
        let mut payload = vec![0u8; meta.size as usize];
        src.read_at(geometry.offset_of(meta.handle), &mut payload)?;
        let handle = self.store.alloc(&payload)?;

        self.area.objects().del(idx, self.area.space().extent(ext)?)?;
        meta.handle = handle;
        meta.flags.remove(ObjectFlags::IN_TIER | ObjectFlags::BATCHING_OUT);
        meta.flags.insert(ObjectFlags::FROM_TIER);
        let remaining = self.area.sub_stored(ext, 1, meta.size as u64);

        let size = meta.size as i64;
        self.account(meta.group, |c| {
            GroupCounters::add(&c.tier_pages, -1);
            GroupCounters::add(&c.tier_bytes, -size);
            GroupCounters::add(&c.primary_bytes, size);
        });
        if !meta.flags.contains(ObjectFlags::GROUP_CLEARED) && self.groups.resolve(meta.group).is_some() {
            self.area.objects().add(idx, self.area.space().group(meta.group)?)?;
        }
        Ok(remaining)
    }

    /// Move every object still backed by `ext` out of `src`
    ///
    /// Objects under a batch fault are left alone unless `batching` is set.
    fn drain_extent(&self, ext: ExtentId, src: &ExtentPages, batching: bool) -> Result<u64> {
        let anchor = self.area.space().extent(ext)?;
        let members = self
            .area
            .objects()
            .with_chain(anchor, |chain| chain.collect(usize::MAX))?;
        let mut moved = 0;
        for idx in members {
            let pulled = self.store.with_object(ObjectId(idx), |meta| -> Result<bool> {
                let still_here = meta.flags.contains(ObjectFlags::IN_TIER)
                    && self.area.geometry().extent_of(meta.handle) == ext
                    && (batching || !meta.flags.contains(ObjectFlags::BATCHING_OUT));
                if still_here {
                    self.pull_object(idx, meta, ext, src)?;
                }
                Ok(still_here)
            })??;
            if pulled {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Release a claimed extent: free it when empty, else check it back in
    fn put_extent(&self, ext: ExtentId) {
        let result = if self.area.stored_pages(ext) == 0 {
            self.area.free_extent(ext)
        } else {
            self.area.checkin_extent(ext).map(|()| {
                // Catch a last release that raced with the claim above.
                if self.area.stored_pages(ext) == 0 {
                    self.notify_free(ext);
                }
            })
        };
        if let Err(e) = result {
            error!(ext = ext.0, error = %e, "Failed to release extent");
        }
    }

    /// Free an extent whose last object is gone, unless someone holds it
    fn notify_free(&self, ext: ExtentId) {
        match self.area.checkout_extent(ext) {
            Ok(()) => {
                let owner = self.area.owner(ext).unwrap_or(GroupId::NONE);
                if let Err(e) = self.area.free_extent(ext) {
                    error!(ext = ext.0, error = %e, "Failed to free empty extent");
                    return;
                }
                self.account(owner, |c| {
                    c.notify_free.fetch_add(1, Ordering::Relaxed);
                });
                self.stats.record_notify_free();
                debug!(ext = ext.0, group = owner.0, "Empty extent freed");
            }
            Err(e) => debug!(ext = ext.0, error = %e, "Empty extent held elsewhere"),
        }
    }

    // ---- cache maintenance -----------------------------------------------

    pub fn cache_level(&self) -> u32 {
        self.cache_level.load(Ordering::Relaxed)
    }

    /// Change the admission toggles at runtime
    pub fn set_cache_level(&self, level: u32) -> Result<()> {
        let all = CACHE_LEVEL_FAULT_OUT | CACHE_LEVEL_BATCH_OUT | CACHE_LEVEL_RECLAIM_IN;
        if level & !all != 0 {
            return Err(Error::InvalidArgument(format!("cache level {:#x}", level)));
        }
        self.cache_level.store(level, Ordering::Relaxed);
        info!(level, "Cache level changed");
        Ok(())
    }

    /// Pages held by the cache
    pub fn cached_pages(&self) -> u64 {
        (self.area.cache().len() * self.area.geometry().pages_per_extent()) as u64
    }

    /// Move up to `n` evictable cached extents back into the primary store
    ///
    /// Groups are visited lowest reclaim score first.
    pub fn compact(&self, n: usize) -> usize {
        let filter = ExtentFilter::Evictable {
            max_bytes: self.config.cache.move_max_bytes,
        };
        let mut moved = 0;
        for record in self.groups.reclaim_order().into_iter().rev() {
            let group = record.id();
            let attempts = self.area.chain_len(group).unwrap_or(0);
            for _ in 0..attempts {
                if moved >= n {
                    return moved;
                }
                let Ok(ext) = self.area.pick_extent(group, filter) else {
                    break;
                };
                match self.move_cached(ext) {
                    Ok(objects) => {
                        moved += 1;
                        self.stats.record_compaction(objects);
                    }
                    Err(e) => warn!(ext = ext.0, error = %e, "Compaction of extent failed"),
                }
            }
            if moved >= n {
                break;
            }
        }
        debug!(requested = n, moved, "Compaction pass finished");
        moved
    }

    fn move_cached(&self, ext: ExtentId) -> Result<u64> {
        let drained = match self.area.cache().get(ext) {
            Some(entry) => self.drain_extent(ext, entry.pages(), false),
            None => Err(Error::NotFound(format!("{} left the cache", ext))),
        };
        self.put_extent(ext);
        drained
    }

    /// Drop cache entries under memory pressure, up to `nr_pages` pages
    pub fn shrink(&self, nr_pages: u64) -> u64 {
        let per_extent = self.area.geometry().pages_per_extent() as u64;
        let min_bytes = self.config.cache.shrink_min_bytes;
        let base = self.area.space().extent_base();
        let mut freed = 0u64;

        for record in self.groups.reclaim_order() {
            if freed >= nr_pages || record.score() == 0 {
                break;
            }
            let Ok(anchor) = self.area.space().group(record.id()) else {
                continue;
            };
            let walked = self.area.extents().with_chain(anchor, |chain| {
                chain.for_each_rev(|idx| {
                    let ext = ExtentId(idx - base);
                    if self.area.stored_bytes(ext) >= min_bytes && self.area.cache().delete(ext).is_ok() {
                        freed += per_extent;
                    }
                    if freed >= nr_pages {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })
            });
            if let Err(e) = walked {
                warn!(group = record.id().0, error = %e, "Skipping group during shrink");
            }
        }

        if freed > 0 {
            self.stats.record_shrink(freed / per_extent);
        }
        debug!(requested = nr_pages, freed, "Cache shrink finished");
        freed
    }

    /// Drop `nr_pages` cached pages, or down to the soft limit when 0
    pub fn drop_cache(&self, nr_pages: u64) -> u64 {
        let target = if nr_pages == 0 {
            self.cached_pages()
                .saturating_sub(self.config.cache.soft_limit_pages)
        } else {
            nr_pages
        };
        if target == 0 {
            return 0;
        }
        self.shrink(target)
    }

    // ---- reporting -------------------------------------------------------

    pub fn stats(&self) -> StatsSnapshot {
        let cache = self.area.cache();
        self.stats
            .publish_levels(self.area.stored_extents(), cache.len());
        self.stats
            .snapshot(self.area.stored_extents(), self.area.frag_stats(), cache.stats())
    }

    /// Human-readable cache report
    pub fn cache_state(&self) -> String {
        let cache = self.area.cache();
        let level = self.cache_level();
        let stats = cache.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "level {:#x}: fault_out={} batch_out={} reclaim_in={}",
            level,
            level & CACHE_LEVEL_FAULT_OUT != 0,
            level & CACHE_LEVEL_BATCH_OUT != 0,
            level & CACHE_LEVEL_RECLAIM_IN != 0
        );
        let _ = writeln!(
            out,
            "cached {}/{} extents ({} pages)",
            stats.size,
            stats.capacity,
            self.cached_pages()
        );
        let _ = writeln!(
            out,
            "hits {} misses {} hit_rate {:.2}",
            stats.hits, stats.misses, stats.hit_rate
        );
        let pinned: Vec<String> = cache
            .ids()
            .into_iter()
            .filter_map(|ext| cache.pins(ext).filter(|&p| p > 0).map(|p| format!("{}:{}", ext.0, p)))
            .collect();
        let _ = writeln!(out, "pinned [{}]", pinned.join(" "));
        out
    }
}

impl<S: PrimaryStore> Drop for Manager<S> {
    fn drop(&mut self) {
        info!(
            stored = self.area.stored_extents(),
            groups = self.groups.len(),
            "Tier manager detached"
        );
    }
}
