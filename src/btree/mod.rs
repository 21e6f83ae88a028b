//! # B+ Tree Index
//!
//! An ordered, disk-resident multiset of `(Key, Value)` pairs with
//! duplicate keys permitted. The module splits along the same seam as the
//! storage layer below it:
//!
//! - `node`: the binary node format (zerocopy structs that double as the
//!   on-disk layout) and the binary-search primitives over a node's
//!   sorted entry array.
//! - `tree`: the algorithm — insert, erase, find, cursor iteration,
//!   amortize/split/merge rebalancing, and the structural verifier.
//!
//! ## Entry Semantics
//!
//! ```text
//! Leaf entry:   (key, value)                    one stored pair
//! Inner entry:  (child ref, key, value)         child plus its subtree's
//!                                               smallest pair
//! ```
//!
//! Pairs order by key first, then value; each distinct pair appears at
//! most once. Leaves chain forward in ascending pair order, which gives
//! `find` its multi-value scan and the cursor its traversal order.

mod node;
mod tree;

pub use node::{
    ChildRef, Entry, Key, Node, NodeKind, SearchResult, Value,
};
pub use tree::{BPlusTree, Cursor, ValueList};
