//! # B+ Tree
//!
//! This module implements the tree algorithm over the storage layer:
//! insert, erase, key lookup, forward iteration, and the rebalancing that
//! keeps every node within its occupancy bounds.
//!
//! ## Shape
//!
//! All pairs live in leaves; inner nodes hold child references paired with
//! the smallest pair of each child's subtree. Leaves form a forward chain
//! in ascending pair order. The root is always an inner node, is held in
//! memory as a plain member of the tree, and is persisted to block 0 at
//! flush time — it is touched by every operation, so routing it through
//! the cache would only churn residency.
//!
//! ## Rebalancing
//!
//! An insert may leave a child holding `MAX_ENTRIES + 1` entries (the
//! slack slot). The parent first tries to amortize into an immediate
//! sibling below `AMORT_SIZE`, preferring the emptier one; only when both
//! siblings are too full does it split. An erase that drops a child to
//! `MERGE_SIZE` borrows from a sibling at or above `AMORT_SIZE`,
//! preferring the fuller one, and otherwise merges with the smaller
//! sibling. Ties go to the right sibling in every case.
//!
//! Two merges are special at the root:
//!
//! - **Contraction**: a root with exactly two inner children absorbs both
//!   of them, shrinking the tree by one level.
//! - **Last child**: a root with one child lets it drain; when the child
//!   empties, it is recycled and the tree is empty again.
//!
//! ## Descent Protocol
//!
//! The recursive insert and erase run on `ChildRef` values; index 0
//! resolves to the in-memory root, everything else to a pinned cache
//! visitor, both behind the `NodeHandle` enum so the rebalancing code
//! never cares which node is the root. Each level reports upward whether
//! it changed and what its count became; the per-operation `stash` carries
//! the handle of the most recently modified node so a parent can reach the
//! child it must rebalance, and so new subtree minima can propagate up the
//! leftmost spine without re-descending.
//!
//! Inserting a pair below the current subtree minimum stamps the new
//! minimum on inner entries on the way *down*, which is why the insert
//! path never propagates minima back up.
//!
//! ## Iteration
//!
//! A [`Cursor`] holds a leaf visitor and a position and walks the leaf
//! chain. It borrows the tree immutably, so the borrow checker rules out
//! the classic invalidated-iterator bug: no mutation can run while a
//! cursor is live.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, eyre, Result};
use hashbrown::HashSet;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::{
    AMORT_SIZE, BLOCK_BYTES, CACHE_CAPACITY, MAX_ENTRIES, MAX_INDEX, MERGE_SIZE,
};
use crate::storage::{BlockFile, NodeCache, Visitor};

use super::node::{
    balance_from_left, balance_from_right, ChildRef, Entry, Key, Node, NodeKind, SearchResult,
    Value,
};

/// Values bound to one key. Most keys bind a handful of values, so the
/// list stays inline.
pub type ValueList = SmallVec<[Value; 16]>;

struct RootSlot {
    node: RefCell<Box<Node>>,
    dirty: Cell<bool>,
}

/// Uniform handle over the in-memory root and cached nodes, so the
/// rebalancing code reads and mutates parents without knowing which one
/// is the root.
enum NodeHandle<'c> {
    Root(&'c RootSlot),
    Cached(Visitor<'c, Node>),
}

impl NodeHandle<'_> {
    fn read(&self) -> Ref<'_, Node> {
        match self {
            NodeHandle::Root(slot) => Ref::map(slot.node.borrow(), |n| &**n),
            NodeHandle::Cached(visitor) => visitor.read(),
        }
    }

    fn modify(&self) -> RefMut<'_, Node> {
        match self {
            NodeHandle::Root(slot) => {
                slot.dirty.set(true);
                RefMut::map(slot.node.borrow_mut(), |n| &mut **n)
            }
            NodeHandle::Cached(visitor) => visitor.modify(),
        }
    }

    fn is_root(&self) -> bool {
        matches!(self, NodeHandle::Root(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertOutcome {
    /// Nothing changed anywhere (the pair already existed).
    Unchanged,
    /// This node's count changed; the parent must refresh its entry.
    Grew { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraseOutcome {
    /// Nothing changed anywhere (the pair was absent).
    Unchanged,
    /// This node's own count is unchanged but its minimum moved; the
    /// change only matters to parents along the leftmost spine.
    MinChanged { count: usize },
    /// This node lost an entry; the parent must check the underflow
    /// threshold.
    Shrunk { count: usize },
}

/// Disk-backed B+ tree multiset of `(Key, Value)` pairs.
pub struct BPlusTree {
    cache: NodeCache<Node>,
    root: RootSlot,
}

impl BPlusTree {
    /// Opens or creates the tree backed by `<prefix>.dat` and
    /// `<prefix>.bin`.
    pub fn open<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        let (data_path, meta_path) = file_pair(prefix.as_ref());
        let file = BlockFile::open(&data_path, &meta_path, BLOCK_BYTES)?;
        let fresh = file.empty();
        let cache = NodeCache::new(file, CACHE_CAPACITY)?;

        let mut root = Node::new_boxed()?;
        if fresh {
            root.init_inner();
            debug!(path = %data_path.display(), "created empty tree");
        } else {
            cache.read_root(&mut *root)?;
            ensure!(
                root.is_inner(),
                "block 0 of '{}' does not hold a root node",
                data_path.display()
            );
            debug!(
                path = %data_path.display(),
                blocks = cache.block_count(),
                "loaded tree root"
            );
        }

        Ok(Self {
            cache,
            root: RootSlot {
                node: RefCell::new(root),
                dirty: Cell::new(fresh),
            },
        })
    }

    /// True when the tree holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.root.node.borrow().count() == 0
    }

    /// Count of blocks ever minted by the backing file, recycled ones
    /// included.
    pub fn size(&self) -> u64 {
        self.cache.block_count()
    }

    /// Inserts a pair; inserting a pair that already exists is a no-op.
    pub fn insert(&mut self, key: &Key, value: Value) -> Result<()> {
        if self.is_empty() {
            return self.insert_first(key, value);
        }
        {
            let mut stash = None;
            self.insert_at(self.root_ref(), key, value, &mut stash)?;
        }
        if self.root.node.borrow().count() > MAX_ENTRIES {
            self.split_root()?;
        }
        Ok(())
    }

    /// Erases a pair; erasing a pair that is absent is a no-op.
    pub fn erase(&mut self, key: &Key, value: Value) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut stash = None;
        self.erase_at(self.root_ref(), key, value, &mut stash)?;
        Ok(())
    }

    /// Every value bound to `key`, ascending.
    pub fn find(&self, key: &Key) -> Result<ValueList> {
        let mut out = ValueList::new();
        self.collect_values(key, |_| true, &mut out)?;
        Ok(out)
    }

    /// Appends every value bound to `key` to `out`, ascending.
    pub fn find_into(&self, key: &Key, out: &mut ValueList) -> Result<()> {
        self.collect_values(key, |_| true, out)
    }

    /// Values bound to `key` that satisfy `predicate`, ascending.
    pub fn find_if<F>(&self, key: &Key, predicate: F) -> Result<ValueList>
    where
        F: FnMut(Value) -> bool,
    {
        let mut out = ValueList::new();
        self.collect_values(key, predicate, &mut out)?;
        Ok(out)
    }

    /// Cursor positioned at the first pair whose key is not less than
    /// `key`, possibly the end. Holding the cursor borrows the tree, so
    /// mutation while iterating is a compile error.
    pub fn seek(&self, key: &Key) -> Result<Cursor<'_>> {
        if self.is_empty() {
            return Ok(Cursor {
                tree: self,
                leaf: None,
                pos: 0,
            });
        }

        let handle = self.descend_to_leaf(key)?;
        let (pos, count, next) = {
            let node = handle.read();
            (node.lower_bound(key, 0, node.count()), node.count(), node.next_leaf())
        };

        let mut cursor = Cursor {
            tree: self,
            leaf: Some(handle),
            pos,
        };
        if pos == count {
            cursor.pos = 0;
            cursor.leaf = if next == MAX_INDEX {
                None
            } else {
                Some(self.node_at(ChildRef::new(next, 0, NodeKind::Leaf))?)
            };
        }
        Ok(cursor)
    }

    /// Writes the root, every dirty cached node, and the free list to
    /// disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.root.dirty.get() {
            self.cache.write_root(&self.root.node.borrow())?;
            self.root.dirty.set(false);
        }
        let flushed = self.cache.flush_all()?;
        self.cache.sync()?;
        debug!(flushed, "flushed tree");
        Ok(())
    }

    /// Flushes and consumes the tree. `Drop` flushes too, but only this
    /// path reports errors.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    // ----- descent ------------------------------------------------------

    fn root_ref(&self) -> ChildRef {
        ChildRef::new(0, self.root.node.borrow().count(), NodeKind::Inner)
    }

    fn node_at(&self, child: ChildRef) -> Result<NodeHandle<'_>> {
        if child.index() == 0 {
            Ok(NodeHandle::Root(&self.root))
        } else {
            Ok(NodeHandle::Cached(self.cache.get(child.index())?))
        }
    }

    fn descend_to_leaf(&self, key: &Key) -> Result<NodeHandle<'_>> {
        let mut handle = self.node_at(self.root_ref())?;
        loop {
            let next = {
                let node = handle.read();
                if !node.is_inner() {
                    break;
                }
                // Entry 0 only bounds the subtree from below; navigation
                // uses the rest.
                let pos = node.lower_bound(key, 1, node.count());
                node.child(pos - 1)
            };
            handle = self.node_at(next)?;
        }
        Ok(handle)
    }

    // ----- insert -------------------------------------------------------

    fn insert_first(&mut self, key: &Key, value: Value) -> Result<()> {
        let leaf = self.cache.allocate()?;
        {
            let mut node = leaf.modify();
            node.init_leaf();
            node.insert_entry(0, Entry::pair(*key, value));
        }
        let leaf_ref = ChildRef::new(leaf.index(), 1, NodeKind::Leaf);

        let mut root = self.root.node.borrow_mut();
        self.root.dirty.set(true);
        root.set_count(1);
        *root.entry_mut(0) = Entry::branch(leaf_ref, *key, value);
        Ok(())
    }

    fn insert_at<'c>(
        &'c self,
        me: ChildRef,
        key: &Key,
        value: Value,
        stash: &mut Option<NodeHandle<'c>>,
    ) -> Result<InsertOutcome> {
        let handle = self.node_at(me)?;

        if !me.is_inner() {
            let search = {
                let node = handle.read();
                node.binary_search(key, value, 0, node.count())
            };
            let at = match search {
                SearchResult::Found(_) => return Ok(InsertOutcome::Unchanged),
                SearchResult::NotFound(at) => at,
            };
            let count = {
                let mut node = handle.modify();
                node.insert_entry(at, Entry::pair(*key, value));
                node.count()
            };
            *stash = Some(handle);
            return Ok(InsertOutcome::Grew { count });
        }

        let search = {
            let node = handle.read();
            node.binary_search(key, value, 0, node.count())
        };
        let pos = match search {
            SearchResult::Found(_) => return Ok(InsertOutcome::Unchanged),
            SearchResult::NotFound(0) => {
                // New subtree minimum: stamp it on the way down.
                handle.modify().entry_mut(0).set_pair(*key, value);
                0
            }
            SearchResult::NotFound(at) => at - 1,
        };

        let child = handle.read().child(pos);
        let child_count = match self.insert_at(child, key, value, stash)? {
            InsertOutcome::Unchanged => return Ok(InsertOutcome::Unchanged),
            InsertOutcome::Grew { count } => count,
        };

        handle.modify().child_mut(pos).set_count(child_count);
        if child_count <= MAX_ENTRIES {
            return Ok(InsertOutcome::Unchanged);
        }

        let overfull = stash
            .take()
            .ok_or_else(|| eyre!("overfull child without a stashed handle"))?;
        if self.insert_amortize(&handle, pos, &overfull)? {
            return Ok(InsertOutcome::Unchanged);
        }

        self.split_child(&handle, pos, &overfull)?;
        let count = handle.read().count();
        *stash = Some(handle);
        Ok(InsertOutcome::Grew { count })
    }

    /// Tries to shed entries from the overfull child at `pos` into an
    /// immediate sibling below `AMORT_SIZE`. Returns false when both
    /// siblings are too full and the caller must split.
    fn insert_amortize(
        &self,
        parent: &NodeHandle<'_>,
        pos: usize,
        child: &NodeHandle<'_>,
    ) -> Result<bool> {
        let (left_count, right_count) = {
            let node = parent.read();
            (
                (pos > 0).then(|| node.child(pos - 1).count()),
                (pos + 1 < node.count()).then(|| node.child(pos + 1).count()),
            )
        };

        let mut use_left = matches!(left_count, Some(c) if c < AMORT_SIZE);
        let mut use_right = matches!(right_count, Some(c) if c < AMORT_SIZE);
        if use_left && use_right {
            // Prefer the emptier sibling; ties go right.
            if left_count < right_count {
                use_right = false;
            } else {
                use_left = false;
            }
        }

        if use_left {
            let sibling = self.node_at(parent.read().child(pos - 1))?;
            {
                let mut left = sibling.modify();
                let mut right = child.modify();
                balance_from_right(&mut left, &mut right);
            }
            let (sibling_count, child_count) = (sibling.read().count(), child.read().count());
            let child_min = child.read().first_pair();
            let mut node = parent.modify();
            node.child_mut(pos - 1).set_count(sibling_count);
            node.child_mut(pos).set_count(child_count);
            node.entry_mut(pos).set_pair(child_min.0, child_min.1);
        } else if use_right {
            let sibling = self.node_at(parent.read().child(pos + 1))?;
            {
                let mut left = child.modify();
                let mut right = sibling.modify();
                balance_from_left(&mut left, &mut right);
            }
            let (child_count, sibling_count) = (child.read().count(), sibling.read().count());
            let sibling_min = sibling.read().first_pair();
            let mut node = parent.modify();
            node.child_mut(pos).set_count(child_count);
            node.child_mut(pos + 1).set_count(sibling_count);
            node.entry_mut(pos + 1).set_pair(sibling_min.0, sibling_min.1);
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    /// Splits the overfull child at `pos`, threading the new sibling into
    /// the leaf chain and inserting its entry into the parent.
    fn split_child(
        &self,
        parent: &NodeHandle<'_>,
        pos: usize,
        child: &NodeHandle<'_>,
    ) -> Result<()> {
        let twin = self.cache.allocate()?;

        let (kept_count, twin_count, twin_min, kind) = {
            let mut prev = child.modify();
            let mut next = twin.modify();

            let total = prev.count();
            let moved = total >> 1;
            let kept = total - moved;

            // The twin inherits the kind and chain position; the child
            // now points at the twin.
            next.set_link_word(prev.link_word());
            prev.set_next_leaf(twin.index());

            next.write_entries(0, &prev.entries()[kept..]);
            next.set_count(moved);
            prev.set_count(kept);

            (kept, moved, next.first_pair(), prev.kind())
        };

        let mut node = parent.modify();
        node.child_mut(pos).set_count(kept_count);
        node.insert_entry(
            pos + 1,
            Entry::branch(
                ChildRef::new(twin.index(), twin_count, kind),
                twin_min.0,
                twin_min.1,
            ),
        );
        Ok(())
    }

    /// Replaces an overflowing root's content with two fresh inner
    /// children, each holding half of its entries.
    fn split_root(&self) -> Result<()> {
        let left = self.cache.allocate()?;
        let right = self.cache.allocate()?;

        let mut root = self.root.node.borrow_mut();
        self.root.dirty.set(true);

        let total = root.count();
        let left_count = total >> 1;
        let right_count = total - left_count;

        {
            let mut node = left.modify();
            node.init_inner();
            node.write_entries(0, &root.entries()[..left_count]);
            node.set_count(left_count);
        }
        {
            let mut node = right.modify();
            node.init_inner();
            node.write_entries(0, &root.entries()[left_count..]);
            node.set_count(right_count);
        }

        let left_min = (root.entry(0).key, root.entry(0).value);
        let right_min = (root.entry(left_count).key, root.entry(left_count).value);

        root.set_count(2);
        *root.entry_mut(0) = Entry::branch(
            ChildRef::new(left.index(), left_count, NodeKind::Inner),
            left_min.0,
            left_min.1,
        );
        *root.entry_mut(1) = Entry::branch(
            ChildRef::new(right.index(), right_count, NodeKind::Inner),
            right_min.0,
            right_min.1,
        );
        Ok(())
    }

    // ----- erase --------------------------------------------------------

    fn erase_at<'c>(
        &'c self,
        me: ChildRef,
        key: &Key,
        value: Value,
        stash: &mut Option<NodeHandle<'c>>,
    ) -> Result<EraseOutcome> {
        let handle = self.node_at(me)?;

        if !me.is_inner() {
            let search = {
                let node = handle.read();
                node.binary_search(key, value, 0, node.count())
            };
            let SearchResult::Found(at) = search else {
                return Ok(EraseOutcome::Unchanged);
            };
            let count = {
                let mut node = handle.modify();
                node.remove_entry(at);
                node.count()
            };
            *stash = Some(handle);
            return Ok(EraseOutcome::Shrunk { count });
        }

        let search = {
            let node = handle.read();
            node.binary_search(key, value, 0, node.count())
        };
        let (pos, min_changed) = match search {
            // Below the subtree minimum: the pair cannot be here.
            SearchResult::NotFound(0) => return Ok(EraseOutcome::Unchanged),
            SearchResult::NotFound(at) => (at - 1, false),
            // The erased pair is this entry's subtree minimum.
            SearchResult::Found(at) => (at, true),
        };

        let child = handle.read().child(pos);
        let (child_count, shrunk) = match self.erase_at(child, key, value, stash)? {
            EraseOutcome::Unchanged => return Ok(EraseOutcome::Unchanged),
            EraseOutcome::MinChanged { count } => (count, false),
            EraseOutcome::Shrunk { count } => (count, true),
        };

        {
            // A drained node has no minimum to propagate; its entry is
            // about to be removed by the merge below.
            let new_min = if min_changed {
                let stashed = stash
                    .as_ref()
                    .ok_or_else(|| eyre!("modified child without a stashed handle"))?;
                let node = stashed.read();
                (node.count() > 0).then(|| node.first_pair())
            } else {
                None
            };
            let mut node = handle.modify();
            node.child_mut(pos).set_count(child_count);
            if let Some((min_key, min_value)) = new_min {
                node.entry_mut(pos).set_pair(min_key, min_value);
            }
        }

        if !shrunk || child_count > MERGE_SIZE {
            return Ok(self.spine_outcome(&handle, pos, min_changed));
        }

        let underfull = stash
            .take()
            .ok_or_else(|| eyre!("underfull child without a stashed handle"))?;
        if self.erase_amortize(&handle, pos, &underfull)? {
            *stash = Some(underfull);
            return Ok(self.spine_outcome(&handle, pos, min_changed));
        }

        self.erase_merge(&handle, pos, underfull)?;
        let count = handle.read().count();
        *stash = Some(handle);
        Ok(EraseOutcome::Shrunk { count })
    }

    /// A minimum change only concerns the parent when it happened in this
    /// node's first entry, i.e. on the leftmost spine of the subtree.
    fn spine_outcome(&self, handle: &NodeHandle<'_>, pos: usize, min_changed: bool) -> EraseOutcome {
        if min_changed && pos == 0 {
            EraseOutcome::MinChanged {
                count: handle.read().count(),
            }
        } else {
            EraseOutcome::Unchanged
        }
    }

    /// Tries to refill the underfull child at `pos` from an immediate
    /// sibling holding at least `AMORT_SIZE` entries.
    fn erase_amortize(
        &self,
        parent: &NodeHandle<'_>,
        pos: usize,
        child: &NodeHandle<'_>,
    ) -> Result<bool> {
        let (left_count, right_count) = {
            let node = parent.read();
            (
                (pos > 0).then(|| node.child(pos - 1).count()),
                (pos + 1 < node.count()).then(|| node.child(pos + 1).count()),
            )
        };

        let mut use_left = matches!(left_count, Some(c) if c >= AMORT_SIZE);
        let mut use_right = matches!(right_count, Some(c) if c >= AMORT_SIZE);
        if use_left && use_right {
            // Borrow from the fuller sibling; ties go right.
            if left_count > right_count {
                use_right = false;
            } else {
                use_left = false;
            }
        }

        if use_left {
            let sibling = self.node_at(parent.read().child(pos - 1))?;
            {
                let mut left = sibling.modify();
                let mut right = child.modify();
                balance_from_left(&mut left, &mut right);
            }
            let (sibling_count, child_count) = (sibling.read().count(), child.read().count());
            let child_min = child.read().first_pair();
            let mut node = parent.modify();
            node.child_mut(pos - 1).set_count(sibling_count);
            node.child_mut(pos).set_count(child_count);
            node.entry_mut(pos).set_pair(child_min.0, child_min.1);
        } else if use_right {
            let sibling = self.node_at(parent.read().child(pos + 1))?;
            {
                let mut left = child.modify();
                let mut right = sibling.modify();
                balance_from_right(&mut left, &mut right);
            }
            let (child_count, sibling_count) = (child.read().count(), sibling.read().count());
            let sibling_min = sibling.read().first_pair();
            let mut node = parent.modify();
            node.child_mut(pos).set_count(child_count);
            node.child_mut(pos + 1).set_count(sibling_count);
            node.entry_mut(pos + 1).set_pair(sibling_min.0, sibling_min.1);
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    /// Merges the underfull child at `pos` away. Root-level cases contract
    /// the tree; otherwise the child merges with its smaller sibling and
    /// one of the two blocks is recycled.
    fn erase_merge<'c>(
        &'c self,
        parent: &NodeHandle<'c>,
        pos: usize,
        child: NodeHandle<'c>,
    ) -> Result<()> {
        let parent_count = parent.read().count();

        if parent.is_root() && parent_count == 2 && child.read().is_inner() {
            return self.contract_root(pos, child);
        }

        if parent.is_root() && parent_count == 1 {
            // The tree's only node below the root may drain freely; once
            // empty, the tree is empty.
            if child.read().count() == 0 {
                self.recycle_handle(child)?;
                parent.modify().set_count(0);
            }
            return Ok(());
        }

        let merge_right = if pos == 0 {
            true
        } else if pos + 1 >= parent_count {
            false
        } else {
            // Merge with the smaller sibling; ties go right.
            let node = parent.read();
            node.child(pos + 1).count() <= node.child(pos - 1).count()
        };

        if merge_right {
            let sibling = self.node_at(parent.read().child(pos + 1))?;
            let merged = {
                let mut keeper = child.modify();
                keeper.absorb(&sibling.read());
                keeper.count()
            };
            self.recycle_handle(sibling)?;
            let mut node = parent.modify();
            node.remove_entry(pos + 1);
            node.child_mut(pos).set_count(merged);
        } else {
            let sibling = self.node_at(parent.read().child(pos - 1))?;
            let merged = {
                let mut keeper = sibling.modify();
                keeper.absorb(&child.read());
                keeper.count()
            };
            self.recycle_handle(child)?;
            let mut node = parent.modify();
            node.remove_entry(pos);
            node.child_mut(pos - 1).set_count(merged);
        }
        Ok(())
    }

    /// Root contraction: a root with two inner children absorbs both,
    /// flattening the tree by one level.
    fn contract_root<'c>(&'c self, pos: usize, child: NodeHandle<'c>) -> Result<()> {
        let other_ref = self.root.node.borrow().child(1 - pos);
        let other = self.node_at(other_ref)?;
        let (left, right) = if pos == 0 { (child, other) } else { (other, child) };

        {
            let mut root = self.root.node.borrow_mut();
            self.root.dirty.set(true);
            let left_node = left.read();
            let right_node = right.read();
            let left_count = left_node.count();
            root.write_entries(0, left_node.entries());
            root.write_entries(left_count, right_node.entries());
            root.set_count(left_count + right_node.count());
        }

        self.recycle_handle(left)?;
        self.recycle_handle(right)
    }

    fn recycle_handle(&self, handle: NodeHandle<'_>) -> Result<()> {
        match handle {
            NodeHandle::Root(_) => bail!("the root node is never recycled"),
            NodeHandle::Cached(visitor) => self.cache.recycle(visitor),
        }
    }

    // ----- lookup -------------------------------------------------------

    fn collect_values<F>(&self, key: &Key, mut predicate: F, out: &mut ValueList) -> Result<()>
    where
        F: FnMut(Value) -> bool,
    {
        if self.is_empty() {
            return Ok(());
        }

        let mut handle = self.descend_to_leaf(key)?;
        let mut pos = {
            let node = handle.read();
            node.lower_bound(key, 0, node.count())
        };

        loop {
            let next = {
                let node = handle.read();
                while pos < node.count() {
                    let entry = node.entry(pos);
                    if entry.key != *key {
                        return Ok(());
                    }
                    if predicate(entry.value) {
                        out.push(entry.value);
                    }
                    pos += 1;
                }
                node.next_leaf()
            };
            if next == MAX_INDEX {
                return Ok(());
            }
            handle = self.node_at(ChildRef::new(next, 0, NodeKind::Leaf))?;
            pos = 0;
        }
    }

    // ----- verification -------------------------------------------------

    /// Walks the whole tree and checks its structural invariants: count
    /// bounds, subtree minima, leaf-chain order and termination, and
    /// block accounting against the free list. Intended for tests and
    /// debugging; cost is a full tree scan.
    pub fn verify(&self) -> Result<()> {
        let root = self.root.node.borrow();
        ensure!(root.is_inner(), "root must be an inner node");

        let mut seen = HashSet::new();
        let mut leaves = Vec::new();
        let single_child = root.count() == 1;

        for at in 0..root.count() {
            let entry = *root.entry(at);
            if at > 0 {
                let prev = root.entry(at - 1);
                ensure!(
                    (prev.key, prev.value) < (entry.key, entry.value),
                    "root entries out of order at {}",
                    at
                );
            }
            let min = self.verify_subtree(entry.child, single_child, &mut seen, &mut leaves)?;
            ensure!(
                min == (entry.key, entry.value),
                "root entry {} does not hold its subtree minimum",
                at
            );
        }

        for window in leaves.windows(2) {
            ensure!(
                window[0].next == window[1].index,
                "leaf chain skips from block {} to block {}",
                window[0].index,
                window[1].index
            );
            ensure!(
                window[0].last < window[1].first,
                "leaf chain out of order between blocks {} and {}",
                window[0].index,
                window[1].index
            );
        }
        if let Some(last) = leaves.last() {
            ensure!(
                last.next == MAX_INDEX,
                "leaf chain does not terminate at block {}",
                last.index
            );
        }

        let free_list = self.cache.free_blocks();
        let free: HashSet<u32> = free_list.iter().copied().collect();
        ensure!(free.len() == free_list.len(), "free list contains duplicates");
        for index in &seen {
            ensure!(
                !free.contains(index),
                "block {} is both referenced and free",
                index
            );
        }
        ensure!(
            seen.len() + free.len() + 1 == self.cache.block_count() as usize,
            "block accounting mismatch: {} referenced + {} free + root != {} minted",
            seen.len(),
            free.len(),
            self.cache.block_count()
        );

        Ok(())
    }

    fn verify_subtree(
        &self,
        me: ChildRef,
        exempt_underflow: bool,
        seen: &mut HashSet<u32>,
        leaves: &mut Vec<LeafSpan>,
    ) -> Result<(Key, Value)> {
        ensure!(me.index() != 0, "tree entry references block 0");
        ensure!(
            seen.insert(me.index()),
            "block {} referenced more than once",
            me.index()
        );

        let handle = self.node_at(me)?;
        let node = handle.read();

        ensure!(
            node.is_inner() == me.is_inner(),
            "kind mismatch at block {}",
            me.index()
        );
        ensure!(
            node.count() == me.count(),
            "count mismatch at block {}: parent says {}, node holds {}",
            me.index(),
            me.count(),
            node.count()
        );
        ensure!(node.count() >= 1, "block {} is empty", me.index());
        ensure!(
            node.count() <= MAX_ENTRIES,
            "block {} overflows: {} entries",
            me.index(),
            node.count()
        );
        if !exempt_underflow {
            ensure!(
                node.count() >= MERGE_SIZE,
                "block {} underfull: {} < {}",
                me.index(),
                node.count(),
                MERGE_SIZE
            );
        }

        for at in 1..node.count() {
            let prev = node.entry(at - 1);
            let cur = node.entry(at);
            ensure!(
                (prev.key, prev.value) < (cur.key, cur.value),
                "entries out of order in block {}",
                me.index()
            );
        }

        if node.is_inner() {
            let entries: Vec<Entry> = node.entries().to_vec();
            drop(node);
            for (at, entry) in entries.iter().enumerate() {
                let min = self.verify_subtree(entry.child, false, seen, leaves)?;
                ensure!(
                    min == (entry.key, entry.value),
                    "entry {} of block {} does not hold its subtree minimum",
                    at,
                    me.index()
                );
            }
            Ok((entries[0].key, entries[0].value))
        } else {
            let first = (node.entry(0).key, node.entry(0).value);
            let last_entry = node.entry(node.count() - 1);
            leaves.push(LeafSpan {
                index: me.index(),
                next: node.next_leaf(),
                first,
                last: (last_entry.key, last_entry.value),
            });
            Ok(first)
        }
    }
}

impl Drop for BPlusTree {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "flush on drop failed");
        }
    }
}

struct LeafSpan {
    index: u32,
    next: u32,
    first: (Key, Value),
    last: (Key, Value),
}

/// Forward iterator over pairs, walking the leaf chain. Any tree mutation
/// invalidates it, which the borrow checker enforces.
pub struct Cursor<'t> {
    tree: &'t BPlusTree,
    leaf: Option<NodeHandle<'t>>,
    pos: usize,
}

impl Cursor<'_> {
    /// Returns the current pair and advances, or `None` at the end.
    pub fn next(&mut self) -> Result<Option<(Key, Value)>> {
        let Some(handle) = &self.leaf else {
            return Ok(None);
        };

        let (pair, count, next) = {
            let node = handle.read();
            let entry = node.entry(self.pos);
            ((entry.key, entry.value), node.count(), node.next_leaf())
        };

        self.pos += 1;
        if self.pos >= count {
            self.pos = 0;
            self.leaf = if next == MAX_INDEX {
                None
            } else {
                Some(self.tree.node_at(ChildRef::new(next, 0, NodeKind::Leaf))?)
            };
        }
        Ok(Some(pair))
    }

    pub fn valid(&self) -> bool {
        self.leaf.is_some()
    }
}

fn file_pair(prefix: &Path) -> (PathBuf, PathBuf) {
    let mut data = prefix.as_os_str().to_os_string();
    data.push(".dat");
    let mut meta = prefix.as_os_str().to_os_string();
    meta.push(".bin");
    (PathBuf::from(data), PathBuf::from(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn open_tree() -> (TempDir, BPlusTree) {
        let dir = tempdir().unwrap();
        let tree = BPlusTree::open(dir.path().join("t")).unwrap();
        (dir, tree)
    }

    fn key(text: &str) -> Key {
        Key::from_bytes(text.as_bytes()).unwrap()
    }

    /// Fixed-width decimal key, so numeric order matches byte order.
    fn numbered_key(n: u32) -> Key {
        key(&format!("{:010}", n))
    }

    #[test]
    fn open_creates_empty_tree() {
        let (_dir, tree) = open_tree();

        assert!(tree.is_empty());
        assert_eq!(tree.size(), 1);
        tree.verify().unwrap();
    }

    #[test]
    fn first_insert_is_findable() {
        let (_dir, mut tree) = open_tree();

        tree.insert(&key("hello"), 7).unwrap();

        assert!(!tree.is_empty());
        assert_eq!(tree.find(&key("hello")).unwrap().as_slice(), &[7]);
        assert!(tree.find(&key("absent")).unwrap().is_empty());
        tree.verify().unwrap();
    }

    #[test]
    fn inserting_an_existing_pair_is_a_noop() {
        let (_dir, mut tree) = open_tree();

        tree.insert(&key("k"), 1).unwrap();
        tree.insert(&key("k"), 1).unwrap();

        assert_eq!(tree.find(&key("k")).unwrap().as_slice(), &[1]);
        tree.verify().unwrap();
    }

    #[test]
    fn duplicate_keys_return_values_ascending() {
        let (_dir, mut tree) = open_tree();

        for value in [5, 1, 9, 3, 7] {
            tree.insert(&key("dup"), value).unwrap();
        }

        assert_eq!(tree.find(&key("dup")).unwrap().as_slice(), &[1, 3, 5, 7, 9]);
        tree.verify().unwrap();
    }

    #[test]
    fn erasing_a_missing_pair_is_a_noop() {
        let (_dir, mut tree) = open_tree();

        tree.insert(&key("k"), 1).unwrap();
        tree.erase(&key("k"), 2).unwrap();
        tree.erase(&key("other"), 1).unwrap();

        assert_eq!(tree.find(&key("k")).unwrap().as_slice(), &[1]);
        tree.verify().unwrap();
    }

    #[test]
    fn erasing_the_last_pair_empties_the_tree() {
        let (_dir, mut tree) = open_tree();

        tree.insert(&key("only"), 1).unwrap();
        tree.erase(&key("only"), 1).unwrap();

        assert!(tree.is_empty());
        assert!(tree.find(&key("only")).unwrap().is_empty());
        tree.verify().unwrap();

        // The emptied tree accepts new pairs.
        tree.insert(&key("again"), 2).unwrap();
        assert_eq!(tree.find(&key("again")).unwrap().as_slice(), &[2]);
        tree.verify().unwrap();
    }

    #[test]
    fn ascending_bulk_insert_splits_the_root() {
        let (_dir, mut tree) = open_tree();

        for n in 0..5000 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }

        tree.verify().unwrap();
        for n in (0..5000).step_by(111) {
            assert_eq!(
                tree.find(&numbered_key(n)).unwrap().as_slice(),
                &[n as Value],
                "key {} lost",
                n
            );
        }
    }

    #[test]
    fn descending_bulk_insert_exercises_minimum_stamping() {
        let (_dir, mut tree) = open_tree();

        for n in (0..3000).rev() {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }

        tree.verify().unwrap();
        for n in (0..3000).step_by(97) {
            assert_eq!(tree.find(&numbered_key(n)).unwrap().as_slice(), &[n as Value]);
        }
    }

    #[test]
    fn erasing_most_pairs_contracts_the_root() {
        let (_dir, mut tree) = open_tree();

        for n in 0..4000 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        for n in 0..3990 {
            tree.erase(&numbered_key(n), n as Value).unwrap();
        }

        tree.verify().unwrap();
        for n in 3990..4000 {
            assert_eq!(tree.find(&numbered_key(n)).unwrap().as_slice(), &[n as Value]);
        }
        assert!(tree.find(&numbered_key(0)).unwrap().is_empty());
    }

    #[test]
    fn erase_everything_then_reuse() {
        let (_dir, mut tree) = open_tree();

        for n in 0..1500 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        for n in 0..1500 {
            tree.erase(&numbered_key(n), n as Value).unwrap();
        }

        assert!(tree.is_empty());
        tree.verify().unwrap();

        for n in 0..100 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }
        tree.verify().unwrap();
        assert_eq!(tree.find(&numbered_key(42)).unwrap().as_slice(), &[42]);
    }

    #[test]
    fn interleaved_inserts_and_erases_hold_invariants() {
        let (_dir, mut tree) = open_tree();

        // Deterministic scatter over a small key space to force duplicate
        // keys and repeated rebalancing.
        let mut state = 0x2545_F491u32;
        let mut shadow: Vec<(u32, Value)> = Vec::new();
        for round in 0..4000 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let k = state % 400;
            let v = (state >> 16) as Value % 8;
            if round % 3 == 2 {
                tree.erase(&numbered_key(k), v).unwrap();
                shadow.retain(|&pair| pair != (k, v));
            } else {
                tree.insert(&numbered_key(k), v).unwrap();
                if !shadow.contains(&(k, v)) {
                    shadow.push((k, v));
                }
            }
            if round % 500 == 499 {
                tree.verify().unwrap();
            }
        }

        tree.verify().unwrap();
        for k in 0..400 {
            let mut expected: Vec<Value> = shadow
                .iter()
                .filter(|&&(sk, _)| sk == k)
                .map(|&(_, v)| v)
                .collect();
            expected.sort_unstable();
            assert_eq!(
                tree.find(&numbered_key(k)).unwrap().as_slice(),
                expected.as_slice(),
                "mismatch for key {}",
                k
            );
        }
    }

    #[test]
    fn find_on_the_largest_key_stops_at_chain_end() {
        let (_dir, mut tree) = open_tree();

        for n in 0..2000 {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }

        assert_eq!(
            tree.find(&numbered_key(1999)).unwrap().as_slice(),
            &[1999]
        );
    }

    #[test]
    fn find_if_filters_values() {
        let (_dir, mut tree) = open_tree();

        for value in 0..10 {
            tree.insert(&key("dup"), value).unwrap();
        }

        let even = tree.find_if(&key("dup"), |v| v % 2 == 0).unwrap();
        assert_eq!(even.as_slice(), &[0, 2, 4, 6, 8]);
    }

    #[test]
    fn cursor_scans_pairs_in_order() {
        let (_dir, mut tree) = open_tree();

        for n in (0..1000).rev() {
            tree.insert(&numbered_key(n), n as Value).unwrap();
        }

        let mut cursor = tree.seek(&numbered_key(0)).unwrap();
        let mut count = 0;
        let mut previous: Option<(Key, Value)> = None;
        while let Some(pair) = cursor.next().unwrap() {
            if let Some(prev) = previous {
                assert!(prev < pair, "cursor went backwards");
            }
            previous = Some(pair);
            count += 1;
        }
        assert_eq!(count, 1000);
    }

    #[test]
    fn seek_positions_at_first_pair_with_key() {
        let (_dir, mut tree) = open_tree();

        tree.insert(&key("a"), 1).unwrap();
        tree.insert(&key("c"), 3).unwrap();
        tree.insert(&key("c"), 4).unwrap();
        tree.insert(&key("e"), 5).unwrap();

        let mut cursor = tree.seek(&key("c")).unwrap();
        assert_eq!(cursor.next().unwrap(), Some((key("c"), 3)));
        assert_eq!(cursor.next().unwrap(), Some((key("c"), 4)));
        assert_eq!(cursor.next().unwrap(), Some((key("e"), 5)));
        assert_eq!(cursor.next().unwrap(), None);

        // Seeking past every key lands at the end.
        let mut past = tree.seek(&key("z")).unwrap();
        assert!(!past.valid());
        assert_eq!(past.next().unwrap(), None);
    }

    #[test]
    fn seek_on_empty_tree_is_end() {
        let (_dir, tree) = open_tree();

        let mut cursor = tree.seek(&key("any")).unwrap();
        assert!(!cursor.valid());
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn size_counts_all_minted_blocks() {
        let (_dir, mut tree) = open_tree();

        assert_eq!(tree.size(), 1);
        tree.insert(&key("a"), 1).unwrap();
        assert_eq!(tree.size(), 2);

        // Erasing the pair recycles the leaf, but the block stays minted.
        tree.erase(&key("a"), 1).unwrap();
        assert_eq!(tree.size(), 2);
    }
}
