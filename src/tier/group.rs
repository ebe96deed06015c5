//! Group records and the directory that resolves them
//!
//! A group owns two list anchors (its object LRU and its extent LRU) and a
//! handful of counters the tier updates directly. Records are shared through
//! `Arc` so the list engine can hold an anchor for the duration of a locked
//! walk even if the group is detached concurrently.

use super::index::GroupId;
use super::list::{Lane, ListNode};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-group accounting updated by the tier
#[derive(Debug, Default)]
pub struct GroupCounters {
    /// Bytes of this group's objects held by the primary store
    pub primary_bytes: AtomicI64,
    /// Pages of this group's objects held by the secondary tier
    pub tier_pages: AtomicI64,
    /// Bytes of this group's objects held by the secondary tier
    pub tier_bytes: AtomicI64,
    /// Extents freed because their last object was released
    pub notify_free: AtomicU64,
    /// Extents written for this group
    pub reclaimed_extents: AtomicU64,
    /// Extents read back for this group
    pub faulted_extents: AtomicU64,
}

impl GroupCounters {
    pub fn add(counter: &AtomicI64, delta: i64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Serializable view of one group
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub id: u16,
    pub score: u64,
    pub primary_bytes: i64,
    pub tier_pages: i64,
    pub tier_bytes: i64,
    pub notify_free: u64,
    pub reclaimed_extents: u64,
    pub faulted_extents: u64,
}

/// Externally owned group record
#[derive(Debug)]
pub struct GroupRecord {
    id: GroupId,
    objects: ListNode,
    extents: ListNode,
    score: AtomicU64,
    counters: GroupCounters,
}

impl GroupRecord {
    /// A record whose anchors are empty chains at unified index `anchor`
    pub fn new(id: GroupId, anchor: u32) -> Self {
        Self {
            id,
            objects: ListNode::new(anchor),
            extents: ListNode::new(anchor),
            score: AtomicU64::new(1),
            counters: GroupCounters::default(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn anchor(&self, lane: Lane) -> &ListNode {
        match lane {
            Lane::Objects => &self.objects,
            Lane::Extents => &self.extents,
        }
    }

    /// Reclaim priority; 0 excludes the group from pressure eviction
    pub fn score(&self) -> u64 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn set_score(&self, score: u64) {
        self.score.store(score, Ordering::Relaxed)
    }

    pub fn counters(&self) -> &GroupCounters {
        &self.counters
    }

    pub fn stats(&self) -> GroupStats {
        let c = &self.counters;
        GroupStats {
            id: self.id.0,
            score: self.score(),
            primary_bytes: c.primary_bytes.load(Ordering::Relaxed),
            tier_pages: c.tier_pages.load(Ordering::Relaxed),
            tier_bytes: c.tier_bytes.load(Ordering::Relaxed),
            notify_free: c.notify_free.load(Ordering::Relaxed),
            reclaimed_extents: c.reclaimed_extents.load(Ordering::Relaxed),
            faulted_extents: c.faulted_extents.load(Ordering::Relaxed),
        }
    }
}

/// Resolves group ids to records
pub trait GroupDirectory: Send + Sync {
    fn resolve(&self, id: GroupId) -> Option<Arc<GroupRecord>>;

    /// Live groups, highest reclaim score first
    fn reclaim_order(&self) -> Vec<Arc<GroupRecord>>;
}

/// Concurrent in-memory group directory
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: DashMap<u16, Arc<GroupRecord>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh record anchored at unified index `anchor`
    pub fn create(&self, id: GroupId, anchor: u32) -> Result<Arc<GroupRecord>> {
        match self.groups.entry(id.0) {
            Entry::Occupied(_) => Err(Error::AlreadyExists(format!("{} already attached", id))),
            Entry::Vacant(slot) => {
                let record = Arc::new(GroupRecord::new(id, anchor));
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn remove(&self, id: GroupId) -> Option<Arc<GroupRecord>> {
        self.groups.remove(&id.0).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl GroupDirectory for GroupRegistry {
    fn resolve(&self, id: GroupId) -> Option<Arc<GroupRecord>> {
        self.groups.get(&id.0).map(|entry| entry.value().clone())
    }

    fn reclaim_order(&self) -> Vec<Arc<GroupRecord>> {
        let mut groups: Vec<_> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by(|a, b| b.score().cmp(&a.score()).then(a.id().cmp(&b.id())));
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolve() -> Result<()> {
        let registry = GroupRegistry::new();
        assert!(registry.resolve(GroupId(1)).is_none());
        let record = registry.create(GroupId(1), 41)?;
        assert_eq!(record.id(), GroupId(1));
        assert!(registry.resolve(GroupId(1)).is_some());
        assert!(matches!(registry.create(GroupId(1), 41), Err(Error::AlreadyExists(_))));
        assert!(registry.remove(GroupId(1)).is_some());
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn test_reclaim_order() -> Result<()> {
        let registry = GroupRegistry::new();
        registry.create(GroupId(1), 1)?.set_score(10);
        registry.create(GroupId(2), 2)?.set_score(30);
        registry.create(GroupId(3), 3)?.set_score(0);

        let order: Vec<u16> = registry.reclaim_order().iter().map(|g| g.id().0).collect();
        assert_eq!(order, vec![2, 1, 3]);
        Ok(())
    }

    #[test]
    fn test_counters_snapshot() {
        let record = GroupRecord::new(GroupId(4), 4);
        GroupCounters::add(&record.counters().tier_pages, 3);
        GroupCounters::add(&record.counters().tier_pages, -1);
        let stats = record.stats();
        assert_eq!(stats.tier_pages, 2);
        assert_eq!(stats.score, 1);
    }
}
