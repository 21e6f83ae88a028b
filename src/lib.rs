//! # perchdb — Embedded On-Disk B+ Tree
//!
//! perchdb is a persistent B+ tree storing an ordered multiset of
//! fixed-width keys bound to 32-bit values, with duplicate keys
//! permitted. It is the indexing primitive for small embedded databases:
//! one file pair on disk, a bounded in-memory cache, and a line-oriented
//! command driver on top.
//!
//! ## Quick Start
//!
//! ```ignore
//! use perchdb::{BPlusTree, Key};
//!
//! let mut tree = BPlusTree::open("./data/index")?;   // index.dat + index.bin
//! tree.insert(&Key::from_bytes(b"alice")?, 1)?;
//! tree.insert(&Key::from_bytes(b"alice")?, 2)?;
//!
//! let values = tree.find(&Key::from_bytes(b"alice")?)?;   // [1, 2]
//! tree.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Command driver (cli)               │  insert / delete / find script
//! ├─────────────────────────────────────┤
//! │  B+ tree (btree::tree)              │  descent, split/merge/amortize,
//! │                                     │  cursors, verifier
//! ├─────────────────────────────────────┤
//! │  Node layout (btree::node)          │  zerocopy on-disk format,
//! │                                     │  binary-search primitives
//! ├─────────────────────────────────────┤
//! │  Node cache (storage::cache)        │  bounded residency, pinned
//! │                                     │  visitors, dirty write-back
//! ├─────────────────────────────────────┤
//! │  Block file (storage::block_file)   │  P.dat blocks, P.bin free list
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Scope
//!
//! Single-threaded and synchronous by design. Durability is at flush
//! granularity: a crash mid-session leaves the file pair in an
//! unspecified state. There is no WAL, no concurrency, and no secondary
//! index — callers needing those belong one abstraction level up.
//!
//! ## Module Overview
//!
//! - [`btree`]: node format, search primitives, and the tree algorithm
//! - [`storage`]: block file, free-list allocator, and the node cache
//! - [`cli`]: command protocol parser and script runner
//! - [`config`]: tree geometry and cache sizing constants

pub mod btree;
pub mod cli;
pub mod config;
pub mod storage;

pub use btree::{BPlusTree, Cursor, Key, Value, ValueList};
