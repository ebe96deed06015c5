//! Unified indexed list engine
//!
//! One doubly-linked circular list primitive serves three purposes over the
//! unified index space:
//!
//! ```text
//! object LRU of group G      anchor = G (objects lane)   members = objects
//! objects backed by extent E anchor = E (objects lane)   members = objects
//! extent LRU of group G      anchor = G (extents lane)   members = extents
//! ```
//!
//! Links are indices, not pointers. A node whose `next` is itself is unlinked
//! (for an anchor: the chain is empty). Object and extent nodes live in a
//! flat array owned by the table; group anchors are embedded in the
//! externally owned [`GroupRecord`] and resolved through a [`GroupDirectory`]
//! on every access, so the group lifetime stays outside this module.
//!
//! Links are only mutated while the anchor's lock is held. The `ready` flag
//! and the owner tag are atomics readable without the lock.

use super::group::{GroupDirectory, GroupRecord};
use super::index::{GroupId, IndexSpace, Slot};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ops::{ControlFlow, Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::error;

/// A list node: links, owner tag, claim flag and the anchor lock
#[derive(Debug)]
pub struct ListNode {
    prev: AtomicU32,
    next: AtomicU32,
    owner: AtomicU16,
    ready: AtomicBool,
    lock: Mutex<()>,
}

impl ListNode {
    pub fn new(idx: u32) -> Self {
        Self {
            prev: AtomicU32::new(idx),
            next: AtomicU32::new(idx),
            owner: AtomicU16::new(0),
            ready: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    fn reset(&self, idx: u32) {
        self.prev.store(idx, Ordering::Relaxed);
        self.next.store(idx, Ordering::Relaxed);
        self.owner.store(0, Ordering::Release);
        self.ready.store(false, Ordering::Release);
    }

    fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    fn set_prev(&self, idx: u32) {
        self.prev.store(idx, Ordering::Relaxed)
    }

    fn set_next(&self, idx: u32) {
        self.next.store(idx, Ordering::Relaxed)
    }
}

/// Which of the two anchors of a group record a table links through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Objects,
    Extents,
}

/// Resolved node storage: table-owned or embedded in a group record
pub enum NodeRef<'a> {
    Flat(&'a ListNode),
    Record(Arc<GroupRecord>, Lane),
}

impl Deref for NodeRef<'_> {
    type Target = ListNode;

    fn deref(&self) -> &ListNode {
        match self {
            NodeRef::Flat(node) => node,
            NodeRef::Record(record, lane) => record.anchor(*lane),
        }
    }
}

/// List table over a contiguous range of flat nodes plus group anchors
pub struct ListTable {
    space: IndexSpace,
    base: u32,
    nodes: Box<[ListNode]>,
    groups: Arc<dyn GroupDirectory>,
    lane: Lane,
}

impl ListTable {
    /// Create a table whose flat nodes cover `flat` (unified indices)
    pub fn new(space: IndexSpace, flat: Range<u32>, groups: Arc<dyn GroupDirectory>, lane: Lane) -> Self {
        let base = flat.start;
        let nodes = flat.map(ListNode::new).collect();
        Self {
            space,
            base,
            nodes,
            groups,
            lane,
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    fn flat(&self, idx: u32) -> Option<&ListNode> {
        idx.checked_sub(self.base)
            .and_then(|off| self.nodes.get(off as usize))
    }

    /// Resolve any index to its node
    pub fn node(&self, idx: u32) -> Option<NodeRef<'_>> {
        if let Some(node) = self.flat(idx) {
            return Some(NodeRef::Flat(node));
        }
        match self.space.decode(idx) {
            Some(Slot::Group(id)) => self
                .groups
                .resolve(id)
                .map(|record| NodeRef::Record(record, self.lane)),
            _ => None,
        }
    }

    fn require(&self, idx: u32) -> Result<NodeRef<'_>> {
        self.node(idx).ok_or_else(|| {
            error!(idx, lane = ?self.lane, "No list node for index");
            Error::InvalidArgument(format!("no list node for index {}", idx))
        })
    }

    /// Reset `idx` to an empty, unowned, unclaimable node
    pub fn init(&self, idx: u32) -> Result<()> {
        self.require(idx)?.reset(idx);
        Ok(())
    }

    pub fn owner(&self, idx: u32) -> Result<GroupId> {
        Ok(GroupId(self.require(idx)?.owner.load(Ordering::Acquire)))
    }

    pub fn set_owner(&self, idx: u32, owner: GroupId) -> Result<()> {
        self.require(idx)?.owner.store(owner.0, Ordering::Release);
        Ok(())
    }

    /// Replace the owner tag, returning the previous one
    pub fn swap_owner(&self, idx: u32, owner: GroupId) -> Result<GroupId> {
        Ok(GroupId(self.require(idx)?.owner.swap(owner.0, Ordering::AcqRel)))
    }

    /// Mark `idx` claimable again; false if it already was
    pub fn set_ready(&self, idx: u32) -> Result<bool> {
        Ok(!self.require(idx)?.ready.swap(true, Ordering::AcqRel))
    }

    /// Try to claim `idx` exclusively; false if it is not claimable
    pub fn try_claim(&self, idx: u32) -> Result<bool> {
        Ok(self
            .require(idx)?
            .ready
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    pub fn is_ready(&self, idx: u32) -> Result<bool> {
        Ok(self.require(idx)?.ready.load(Ordering::Acquire))
    }

    /// True when `idx` is currently a member of some chain
    pub fn is_linked(&self, idx: u32) -> Result<bool> {
        Ok(self.require(idx)?.next() != idx)
    }

    pub fn prev(&self, idx: u32) -> Result<u32> {
        Ok(self.require(idx)?.prev())
    }

    pub fn next(&self, idx: u32) -> Result<u32> {
        Ok(self.require(idx)?.next())
    }

    /// Run `f` with the lock of `anchor` held
    pub fn with_chain<R>(&self, anchor: u32, f: impl FnOnce(&Chain<'_>) -> R) -> Result<R> {
        let node = self.require(anchor)?;
        let _guard = node.lock.lock();
        let chain = Chain {
            table: self,
            anchor,
            head: &node,
        };
        Ok(f(&chain))
    }

    /// Append `idx` to the tail of `anchor`'s chain, taking the lock
    pub fn add(&self, idx: u32, anchor: u32) -> Result<bool> {
        self.with_chain(anchor, |chain| chain.push_back(idx))
    }

    /// Unlink `idx` from `anchor`'s chain, taking the lock
    pub fn del(&self, idx: u32, anchor: u32) -> Result<bool> {
        self.with_chain(anchor, |chain| chain.remove(idx))
    }
}

/// A chain whose anchor lock is held by the caller
pub struct Chain<'a> {
    table: &'a ListTable,
    anchor: u32,
    head: &'a ListNode,
}

impl<'a> Chain<'a> {
    fn link(&self, idx: u32) -> Option<&'a ListNode> {
        if idx == self.anchor {
            Some(self.head)
        } else {
            self.table.flat(idx)
        }
    }

    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    pub fn is_empty(&self) -> bool {
        self.head.next() == self.anchor
    }

    pub fn first(&self) -> Option<u32> {
        let idx = self.head.next();
        (idx != self.anchor).then_some(idx)
    }

    pub fn last(&self) -> Option<u32> {
        let idx = self.head.prev();
        (idx != self.anchor).then_some(idx)
    }

    pub fn is_first(&self, idx: u32) -> bool {
        self.head.next() == idx
    }

    pub fn is_last(&self, idx: u32) -> bool {
        self.head.prev() == idx
    }

    /// Append to the tail
    pub fn push_back(&self, idx: u32) -> bool {
        let Some(node) = self.table.flat(idx) else {
            error!(idx, anchor = self.anchor, "Cannot link non-member index");
            return false;
        };
        if node.next() != idx {
            error!(idx, anchor = self.anchor, "Node already linked");
            return false;
        }
        let tail = self.head.prev();
        let Some(tail_node) = self.link(tail) else {
            error!(idx, tail, anchor = self.anchor, "Corrupt chain tail");
            return false;
        };
        node.set_prev(tail);
        node.set_next(self.anchor);
        tail_node.set_next(idx);
        self.head.set_prev(idx);
        true
    }

    /// Unlink `idx`; false if it was not linked
    pub fn remove(&self, idx: u32) -> bool {
        let Some(node) = self.table.flat(idx) else {
            error!(idx, anchor = self.anchor, "Cannot unlink non-member index");
            return false;
        };
        let (prev, next) = (node.prev(), node.next());
        if next == idx {
            return false;
        }
        match (self.link(prev), self.link(next)) {
            (Some(p), Some(n)) => {
                p.set_next(next);
                n.set_prev(prev);
            }
            _ => {
                error!(idx, prev, next, anchor = self.anchor, "Corrupt chain links");
                return false;
            }
        }
        node.set_prev(idx);
        node.set_next(idx);
        true
    }

    fn walk(&self, forward: bool, mut f: impl FnMut(u32) -> ControlFlow<()>) {
        let step = |node: &ListNode| if forward { node.next() } else { node.prev() };
        let mut idx = step(self.head);
        let mut budget = self.table.nodes.len();
        while idx != self.anchor {
            let Some(node) = self.link(idx) else {
                error!(idx, anchor = self.anchor, "Corrupt chain during walk");
                return;
            };
            if budget == 0 {
                error!(anchor = self.anchor, "Chain longer than table, cycle suspected");
                return;
            }
            budget -= 1;
            // Read the successor first so `f` may unlink `idx`.
            let following = step(node);
            if f(idx).is_break() {
                return;
            }
            idx = following;
        }
    }

    /// Walk head (coldest) to tail
    pub fn for_each(&self, f: impl FnMut(u32) -> ControlFlow<()>) {
        self.walk(true, f)
    }

    /// Walk tail (hottest) to head
    pub fn for_each_rev(&self, f: impl FnMut(u32) -> ControlFlow<()>) {
        self.walk(false, f)
    }

    /// First member, head-first, accepted by `pred`
    pub fn find(&self, mut pred: impl FnMut(u32) -> bool) -> Option<u32> {
        let mut found = None;
        self.for_each(|idx| {
            if pred(idx) {
                found = Some(idx);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    /// Up to `max` members, head-first
    pub fn collect(&self, max: usize) -> Vec<u32> {
        let mut out = Vec::new();
        self.for_each(|idx| {
            if out.len() >= max {
                return ControlFlow::Break(());
            }
            out.push(idx);
            ControlFlow::Continue(())
        });
        out
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| {
            n += 1;
            ControlFlow::Continue(())
        });
        n
    }
}
