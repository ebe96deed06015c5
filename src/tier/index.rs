//! Identifiers, extent geometry and the unified index space
//!
//! Objects, extents and groups share one dense `u32` index range so the
//! list engine can link any of them with the same primitive:
//!
//! ```text
//! [0, nr_objs)                                   objects
//! [nr_objs, nr_objs + nr_exts)                   extents
//! [nr_objs + nr_exts, nr_objs + nr_exts + nr_groups)  groups (group 0 invalid)
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Primary-store object (one original page)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Fixed-size slot in the secondary tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentId(pub u32);

/// Ownership/accounting bucket; 0 means "no owner"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u16);

impl GroupId {
    pub const NONE: GroupId = GroupId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl fmt::Display for ExtentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ext#{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// A decoded position in the unified index space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Object(ObjectId),
    Extent(ExtentId),
    Group(GroupId),
}

/// Mapping between typed ids and unified indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpace {
    nr_objs: u32,
    nr_exts: u32,
    nr_groups: u32,
}

impl IndexSpace {
    pub fn new(nr_objs: u32, nr_exts: u32, nr_groups: u32) -> Self {
        Self {
            nr_objs,
            nr_exts,
            nr_groups,
        }
    }

    pub fn nr_objs(&self) -> u32 {
        self.nr_objs
    }

    pub fn nr_exts(&self) -> u32 {
        self.nr_exts
    }

    pub fn nr_groups(&self) -> u32 {
        self.nr_groups
    }

    /// One past the last valid index
    pub fn len(&self) -> u32 {
        self.nr_objs + self.nr_exts + self.nr_groups
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extent_base(&self) -> u32 {
        self.nr_objs
    }

    pub fn group_base(&self) -> u32 {
        self.nr_objs + self.nr_exts
    }

    pub fn object(&self, id: ObjectId) -> Result<u32> {
        if id.0 >= self.nr_objs {
            return Err(Error::InvalidArgument(format!("{} out of range", id)));
        }
        Ok(id.0)
    }

    pub fn extent(&self, id: ExtentId) -> Result<u32> {
        if id.0 >= self.nr_exts {
            return Err(Error::InvalidArgument(format!("{} out of range", id)));
        }
        Ok(self.extent_base() + id.0)
    }

    pub fn group(&self, id: GroupId) -> Result<u32> {
        if id.is_none() || id.0 as u32 >= self.nr_groups {
            return Err(Error::InvalidArgument(format!("{} out of range", id)));
        }
        Ok(self.group_base() + id.0 as u32)
    }

    pub fn encode(&self, slot: Slot) -> Result<u32> {
        match slot {
            Slot::Object(id) => self.object(id),
            Slot::Extent(id) => self.extent(id),
            Slot::Group(id) => self.group(id),
        }
    }

    pub fn decode(&self, idx: u32) -> Option<Slot> {
        if idx < self.nr_objs {
            return Some(Slot::Object(ObjectId(idx)));
        }
        let idx = idx - self.nr_objs;
        if idx < self.nr_exts {
            return Some(Slot::Extent(ExtentId(idx)));
        }
        let idx = idx - self.nr_exts;
        if idx > 0 && idx < self.nr_groups {
            return Some(Slot::Group(GroupId(idx as u16)));
        }
        None
    }
}

/// Extent size and the address encoding derived from it
///
/// An address packs an extent id above `extent_shift` and the byte offset of
/// an object within that extent below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    extent_shift: u32,
}

impl Geometry {
    pub fn new(extent_shift: u32) -> Self {
        Self { extent_shift }
    }

    pub fn extent_shift(&self) -> u32 {
        self.extent_shift
    }

    pub fn extent_size(&self) -> usize {
        1 << self.extent_shift
    }

    pub fn pages_per_extent(&self) -> usize {
        self.extent_size() / PAGE_SIZE
    }

    /// Upper bound on objects packed into one extent
    pub fn max_objects(&self) -> usize {
        self.pages_per_extent() * 32
    }

    pub fn addr(&self, ext: ExtentId, offset: usize) -> u64 {
        ((ext.0 as u64) << self.extent_shift) | offset as u64
    }

    pub fn extent_of(&self, addr: u64) -> ExtentId {
        ExtentId((addr >> self.extent_shift) as u32)
    }

    /// Byte offset within the extent
    pub fn offset_of(&self, addr: u64) -> usize {
        (addr & ((1u64 << self.extent_shift) - 1)) as usize
    }

    pub fn page_of(&self, addr: u64) -> usize {
        self.offset_of(addr) >> PAGE_SHIFT
    }

    pub fn page_offset_of(&self, addr: u64) -> usize {
        (addr & (PAGE_SIZE as u64 - 1)) as usize
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(15)
    }
}
