//! # Node Layout and Navigation
//!
//! This module defines the binary format shared by inner and leaf nodes and
//! the search primitives that operate on a node's sorted entry array. The
//! `#[repr(C)]` zerocopy structs here *are* the on-disk format: a node is
//! written to its block by viewing it as bytes, so every field and its
//! ordering is load-bearing.
//!
//! ## Node Layout
//!
//! ```text
//! Offset  Size            Field        Description
//! ------  --------------  -----------  ------------------------------------
//! 0       4               link         Kind bit (high) + next-leaf index
//! 4       4               reserved     Reserved, always zero
//! 8       4               entry_count  Number of occupied entry slots
//! 12      80 × 51         entries      MAX_ENTRIES + 1 entry slots
//! ```
//!
//! The extra entry slot lets an insert overflow a node to `MAX_ENTRIES + 1`
//! entries while the parent decides between amortizing into a sibling and
//! splitting.
//!
//! ## Entry Layout
//!
//! ```text
//! Offset  Size       Field   Description
//! ------  ---------  ------  -----------------------------------------
//! 0       8          child   Child reference (inner nodes only)
//! 8       KEY_BYTES  key     Fixed-width key, zero-padded
//! 76      4          value   i32 value
//! ```
//!
//! In a leaf, an entry is a stored pair and `child` stays zeroed. In an
//! inner node, `child` references a subtree and `(key, value)` is the
//! smallest pair stored anywhere in that subtree.
//!
//! ## Kind Packing
//!
//! A child reference packs the node kind into the high bit of its index
//! word, leaving 31 bits of block index space. A node's own `link` word
//! uses the same packing: the high bit is the kind, and for leaves the low
//! bits hold the next leaf's block index (`MAX_INDEX` terminates the
//! chain). Inner nodes leave the low bits unused.
//!
//! ## Search Primitives
//!
//! Three binary searches over the half-open range `[l, r)`, all using the
//! `(l + r) >> 1` midpoint:
//!
//! - `binary_search`: locates an exact `(key, value)` pair, or the
//!   insertion point that keeps the array sorted. Pairs order by key
//!   first, then value, which is what permits duplicate keys.
//! - `lower_bound`: first position whose key is not less than the target.
//! - `upper_bound`: first position whose key is greater than the target.
//!
//! Callers choose the range: descending through an inner node searches
//! `[1, count)` because the first entry only bounds the subtree from
//! below and never participates in navigation.

use std::mem::size_of;

use eyre::{ensure, Result};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{ENTRY_BYTES, KEY_BYTES, MAX_ENTRIES, MAX_INDEX, NODE_BYTES};

const KIND_BIT: u32 = 0x8000_0000;

/// Value payload bound to a key. Pairs with equal keys order by value.
pub type Value = i32;

/// Fixed-width key, ordered lexicographically by unsigned byte.
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct Key([u8; KEY_BYTES]);

impl Key {
    /// Builds a key from raw bytes, zero-padding on the right. Inputs wider
    /// than `KEY_BYTES` are rejected rather than truncated: truncation
    /// would silently alias distinct keys.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() <= KEY_BYTES,
            "key is {} bytes, limit is {}",
            bytes.len(),
            KEY_BYTES
        );
        let mut raw = [0u8; KEY_BYTES];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let printable = self.0.iter().take_while(|&&b| b != 0).copied().collect::<Vec<_>>();
        write!(f, "Key({:?})", String::from_utf8_lossy(&printable))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Inner,
    Leaf,
}

/// Reference to a node held by its parent: block index, occupied entry
/// count, and the node kind packed into the index word's high bit.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChildRef {
    tagged_index: u32,
    count: u32,
}

impl ChildRef {
    pub fn new(index: u32, count: usize, kind: NodeKind) -> Self {
        debug_assert!(index <= MAX_INDEX);
        let tag = match kind {
            NodeKind::Inner => KIND_BIT,
            NodeKind::Leaf => 0,
        };
        Self {
            tagged_index: index | tag,
            count: count as u32,
        }
    }

    pub fn index(&self) -> u32 {
        self.tagged_index & MAX_INDEX
    }

    pub fn is_inner(&self) -> bool {
        self.tagged_index & KIND_BIT != 0
    }

    pub fn kind(&self) -> NodeKind {
        if self.is_inner() {
            NodeKind::Inner
        } else {
            NodeKind::Leaf
        }
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn set_count(&mut self, count: usize) {
        self.count = count as u32;
    }
}

/// One slot in a node's entry array.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Entry {
    pub child: ChildRef,
    pub key: Key,
    pub value: Value,
}

impl Entry {
    /// Leaf entry: a bare pair with a zeroed child word.
    pub fn pair(key: Key, value: Value) -> Self {
        Self {
            child: ChildRef::new(0, 0, NodeKind::Leaf),
            key,
            value,
        }
    }

    /// Inner entry: a child reference plus the subtree's smallest pair.
    pub fn branch(child: ChildRef, key: Key, value: Value) -> Self {
        Self { child, key, value }
    }

    pub fn set_pair(&mut self, key: Key, value: Value) {
        self.key = key;
        self.value = value;
    }
}

/// Result of an exact-pair search over an entry range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The pair exists at this position.
    Found(usize),
    /// The pair is absent; inserting at this position keeps the array
    /// sorted (`entry[i-1] < pair < entry[i]`).
    NotFound(usize),
}

/// In-memory and on-disk image of one tree node.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Node {
    link: u32,
    reserved: u32,
    entry_count: u32,
    entries: [Entry; MAX_ENTRIES + 1],
}

const _: () = assert!(size_of::<Entry>() == ENTRY_BYTES, "Entry layout drifted");
const _: () = assert!(size_of::<Node>() == NODE_BYTES, "Node layout drifted");

impl Node {
    /// Allocates a zeroed node on the heap. A zeroed image is a valid
    /// empty leaf with a dangling next pointer; callers initialize the
    /// link word before use.
    pub fn new_boxed() -> Result<Box<Node>> {
        Node::new_box_zeroed().map_err(|_| eyre::eyre!("failed to allocate node image"))
    }

    /// Resets this node to an empty inner node.
    pub fn init_inner(&mut self) {
        self.link = KIND_BIT;
    }

    /// Resets this node to an empty leaf at the end of the leaf chain.
    pub fn init_leaf(&mut self) {
        self.link = MAX_INDEX;
    }

    pub fn is_inner(&self) -> bool {
        self.link & KIND_BIT != 0
    }

    pub fn kind(&self) -> NodeKind {
        if self.is_inner() {
            NodeKind::Inner
        } else {
            NodeKind::Leaf
        }
    }

    /// Next leaf in the chain, `MAX_INDEX` when this is the last leaf.
    /// Meaningless for inner nodes.
    pub fn next_leaf(&self) -> u32 {
        self.link & MAX_INDEX
    }

    /// Rewrites the next-leaf index, preserving the kind bit.
    pub fn set_next_leaf(&mut self, index: u32) {
        debug_assert!(index <= MAX_INDEX);
        self.link = (self.link & KIND_BIT) | index;
    }

    /// Raw link word, used when a split or merge transfers both the kind
    /// and the chain position from one node to another.
    pub fn link_word(&self) -> u32 {
        self.link
    }

    pub fn set_link_word(&mut self, link: u32) {
        self.link = link;
    }

    pub fn count(&self) -> usize {
        self.entry_count as usize
    }

    pub fn set_count(&mut self, count: usize) {
        debug_assert!(count <= MAX_ENTRIES + 1);
        self.entry_count = count as u32;
    }

    /// Occupied entries, in pair order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries[..self.count()]
    }

    pub fn entry(&self, at: usize) -> &Entry {
        &self.entries[at]
    }

    pub fn entry_mut(&mut self, at: usize) -> &mut Entry {
        &mut self.entries[at]
    }

    pub fn child(&self, at: usize) -> ChildRef {
        self.entries[at].child
    }

    pub fn child_mut(&mut self, at: usize) -> &mut ChildRef {
        &mut self.entries[at].child
    }

    pub fn first_pair(&self) -> (Key, Value) {
        debug_assert!(self.count() > 0);
        (self.entries[0].key, self.entries[0].value)
    }

    /// Inserts an entry at `at`, shifting the tail right.
    pub fn insert_entry(&mut self, at: usize, entry: Entry) {
        let count = self.count();
        debug_assert!(at <= count && count <= MAX_ENTRIES);
        self.entries.copy_within(at..count, at + 1);
        self.entries[at] = entry;
        self.set_count(count + 1);
    }

    /// Removes the entry at `at`, shifting the tail left.
    pub fn remove_entry(&mut self, at: usize) {
        let count = self.count();
        debug_assert!(at < count);
        self.entries.copy_within(at + 1..count, at);
        self.set_count(count - 1);
    }

    /// Overwrites a run of entry slots starting at `at`. The caller adjusts
    /// the count separately; splits write past the current count on purpose.
    pub fn write_entries(&mut self, at: usize, src: &[Entry]) {
        debug_assert!(at + src.len() <= MAX_ENTRIES + 1);
        self.entries[at..at + src.len()].copy_from_slice(src);
    }

    /// Appends every entry of `other`, taking over its link word. Used by
    /// merges: the keeper inherits the appendee's chain position and kind.
    pub fn absorb(&mut self, other: &Node) {
        let count = self.count();
        let extra = other.count();
        debug_assert!(count + extra <= MAX_ENTRIES + 1);
        self.entries[count..count + extra].copy_from_slice(other.entries());
        self.set_count(count + extra);
        self.link = other.link;
    }

    /// Locates `(key, value)` in `[l, r)`, or the position where it would
    /// be inserted. Comparison is by key first, then value.
    pub fn binary_search(&self, key: &Key, value: Value, mut l: usize, mut r: usize) -> SearchResult {
        use std::cmp::Ordering;

        while l != r {
            let mid = (l + r) >> 1;
            let e = &self.entries[mid];
            match key.cmp(&e.key).then(value.cmp(&e.value)) {
                Ordering::Greater => l = mid + 1,
                Ordering::Less => r = mid,
                Ordering::Equal => return SearchResult::Found(mid),
            }
        }
        SearchResult::NotFound(l)
    }

    /// First position in `[l, r)` whose key is not less than `key`.
    pub fn lower_bound(&self, key: &Key, mut l: usize, mut r: usize) -> usize {
        while l != r {
            let mid = (l + r) >> 1;
            if *key > self.entries[mid].key {
                l = mid + 1;
            } else {
                r = mid;
            }
        }
        l
    }

    /// First position in `[l, r)` whose key is greater than `key`.
    pub fn upper_bound(&self, key: &Key, mut l: usize, mut r: usize) -> usize {
        while l != r {
            let mid = (l + r) >> 1;
            if *key >= self.entries[mid].key {
                l = mid + 1;
            } else {
                r = mid;
            }
        }
        l
    }
}

/// Moves entries from the fuller `right` node into `left` until their
/// counts differ by at most one. Entries leave the front of `right` and
/// land at the back of `left`, preserving global order.
pub fn balance_from_right(left: &mut Node, right: &mut Node) {
    let (lc, rc) = (left.count(), right.count());
    debug_assert!(rc > lc);
    let delta = (rc - lc) / 2;
    left.entries[lc..lc + delta].copy_from_slice(&right.entries[..delta]);
    right.entries.copy_within(delta..rc, 0);
    left.set_count(lc + delta);
    right.set_count(rc - delta);
}

/// Moves entries from the fuller `left` node into `right`. Entries leave
/// the back of `left` and land at the front of `right`.
pub fn balance_from_left(left: &mut Node, right: &mut Node) {
    let (lc, rc) = (left.count(), right.count());
    debug_assert!(lc > rc);
    let delta = (lc - rc) / 2;
    right.entries.copy_within(0..rc, delta);
    right.entries[..delta].copy_from_slice(&left.entries[lc - delta..lc]);
    left.set_count(lc - delta);
    right.set_count(rc + delta);
}
