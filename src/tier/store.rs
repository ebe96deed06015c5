//! Primary object store interface
//!
//! The tier never owns object payloads while they live in the primary store;
//! it reads and rewrites per-object metadata through [`PrimaryStore`]. The
//! object lock taken by `with_object` always comes before any list lock.

use super::index::{GroupId, ObjectId};
use crate::error::{Error, Result};
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Per-object state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u32 {
        /// `handle` is a tier address, not a primary-store handle
        const IN_TIER = 1 << 0;
        /// Selected into an extent that is being written
        const WRITE_IN_PROGRESS = 1 << 1;
        /// Part of a group batch fault-in
        const BATCHING_OUT = 1 << 2;
        /// Same-filled page; `handle` holds the fill byte, no payload
        const SAME = 1 << 3;
        /// Brought back from the tier
        const FROM_TIER = 1 << 4;
        /// Owner group was detached
        const GROUP_CLEARED = 1 << 5;
        /// Stored uncompressed
        const HUGE = 1 << 6;
    }
}

/// Metadata of one primary-store object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub handle: u64,
    /// Compressed size in bytes; 0 means empty
    pub size: u32,
    pub flags: ObjectFlags,
    pub group: GroupId,
}

impl ObjectMeta {
    pub fn is_empty(&self) -> bool {
        self.size == 0 && !self.flags.contains(ObjectFlags::SAME)
    }
}

/// Primary compressed object store
pub trait PrimaryStore: Send + Sync {
    /// Number of object slots
    fn capacity(&self) -> u32;

    /// Run `f` with the object lock held
    fn with_object<R>(&self, obj: ObjectId, f: impl FnOnce(&mut ObjectMeta) -> R) -> Result<R>;

    /// Like `with_object`, but `Ok(None)` when the lock is contended
    fn try_with_object<R>(&self, obj: ObjectId, f: impl FnOnce(&mut ObjectMeta) -> R) -> Result<Option<R>>;

    /// Store a compressed payload, returning its handle
    fn alloc(&self, data: &[u8]) -> Result<u64>;

    /// Copy of the payload behind `handle`
    fn load(&self, handle: u64) -> Result<Vec<u8>>;

    fn free(&self, handle: u64);
}

/// In-memory primary store
#[derive(Debug)]
pub struct MemoryStore {
    metas: Box<[Mutex<ObjectMeta>]>,
    payloads: DashMap<u64, Box<[u8]>>,
    next_handle: AtomicU64,
    bytes: AtomicU64,
}

impl MemoryStore {
    pub fn new(nr_objects: u32) -> Self {
        Self {
            metas: (0..nr_objects).map(|_| Mutex::new(ObjectMeta::default())).collect(),
            payloads: DashMap::new(),
            next_handle: AtomicU64::new(1),
            bytes: AtomicU64::new(0),
        }
    }

    fn meta(&self, obj: ObjectId) -> Result<&Mutex<ObjectMeta>> {
        self.metas
            .get(obj.0 as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("{} out of range", obj)))
    }

    /// Payload bytes currently held
    pub fn stored_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of live payloads
    pub fn payloads(&self) -> usize {
        self.payloads.len()
    }
}

impl PrimaryStore for MemoryStore {
    fn capacity(&self) -> u32 {
        self.metas.len() as u32
    }

    fn with_object<R>(&self, obj: ObjectId, f: impl FnOnce(&mut ObjectMeta) -> R) -> Result<R> {
        let mut meta = self.meta(obj)?.lock();
        Ok(f(&mut meta))
    }

    fn try_with_object<R>(&self, obj: ObjectId, f: impl FnOnce(&mut ObjectMeta) -> R) -> Result<Option<R>> {
        Ok(self.meta(obj)?.try_lock().map(|mut meta| f(&mut meta)))
    }

    fn alloc(&self, data: &[u8]) -> Result<u64> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.payloads.insert(handle, data.into());
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(handle)
    }

    fn load(&self, handle: u64) -> Result<Vec<u8>> {
        self.payloads
            .get(&handle)
            .map(|p| p.to_vec())
            .ok_or_else(|| Error::NotFound(format!("handle {} not stored", handle)))
    }

    fn free(&self, handle: u64) {
        if let Some((_, payload)) = self.payloads.remove(&handle) {
            self.bytes.fetch_sub(payload.len() as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_load_free() -> Result<()> {
        let store = MemoryStore::new(4);
        let handle = store.alloc(b"payload")?;
        assert_eq!(store.load(handle)?, b"payload");
        assert_eq!(store.stored_bytes(), 7);
        store.free(handle);
        assert!(store.load(handle).unwrap_err().is_not_found());
        assert_eq!(store.stored_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_object_meta_access() -> Result<()> {
        let store = MemoryStore::new(4);
        store.with_object(ObjectId(2), |meta| {
            meta.size = 100;
            meta.flags.insert(ObjectFlags::IN_TIER);
        })?;
        let meta = store.with_object(ObjectId(2), |meta| *meta)?;
        assert_eq!(meta.size, 100);
        assert!(meta.flags.contains(ObjectFlags::IN_TIER));
        assert!(store.with_object(ObjectId(4), |_| ()).is_err());
        Ok(())
    }

    #[test]
    fn test_try_lock_contended() -> Result<()> {
        let store = MemoryStore::new(1);
        let nested = store.with_object(ObjectId(0), |_| store.try_with_object(ObjectId(0), |_| ()))??;
        assert!(nested.is_none());
        Ok(())
    }
}
