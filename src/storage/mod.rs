//! # Storage Layer
//!
//! The storage layer maps block indexes onto a single data file and keeps
//! a bounded set of node images resident in memory. It knows nothing about
//! tree semantics: a block is an opaque fixed-size buffer, and the cache is
//! generic over any zerocopy record that fits one.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  NodeCache<T>  (cache.rs)            │  pinned visitors, clock
//! │    residency map, dirty write-back   │  eviction, free-slot list
//! ├──────────────────────────────────────┤
//! │  BlockFile  (block_file.rs)          │  read/write/allocate/recycle,
//! │    P.dat blocks + P.bin free list    │  positioned file I/O
//! └──────────────────────────────────────┘
//! ```
//!
//! Block 0 is reserved for the tree root. The root is deliberately *not*
//! cached: every operation touches it, so the tree keeps it as a plain
//! member and reads/writes block 0 directly through `read_root` /
//! `write_root` at open and close.
//!
//! ## Durability Model
//!
//! Dirty node images reach disk on eviction and on `flush_all`; the free
//! list reaches disk on `sync`. There is no write-ahead logging and no
//! crash safety: a session that ends without a flush leaves the file pair
//! in an unspecified state.
//!
//! ## Thread Safety
//!
//! None. The whole crate is single-threaded by design; see the cache
//! module docs for how interior mutability replaces the usual lock-based
//! frame table.

mod block_file;
mod cache;

pub use block_file::BlockFile;
pub use cache::{NodeCache, Visitor};
