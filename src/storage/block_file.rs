//! # Block File
//!
//! This module maps `block index -> fixed-size block` onto a plain data
//! file and tracks reclaimed blocks in a sidecar meta file. It is the only
//! component that touches the filesystem; everything above it deals in
//! whole-block buffers.
//!
//! ## File Pair
//!
//! A store opens two files derived from one path prefix:
//!
//! ```text
//! P.dat    Contiguous array of BLOCK_BYTES-sized blocks. Block 0 is
//!          reserved for the tree root and is never recycled.
//! P.bin    Free-list meta file, rewritten on every flush.
//! ```
//!
//! ## Meta File Layout
//!
//! All integers little-endian:
//!
//! ```text
//! Offset       Size  Description
//! ------       ----  ----------------------------------------
//! 0            4     free_count: number of free-list entries
//! 4            4*N   free block indexes, most recently freed last
//! 4 + 4*N      4     next_block: next index to mint by appending
//! ```
//!
//! ## Allocation Strategy
//!
//! `allocate` pops the free list first and only then extends the file by
//! minting `next_block`. Appending never writes: the new block becomes
//! real when its owner first writes it, so an allocated-but-unwritten
//! block must be written before it is read. The cache upholds this by
//! zero-filling and dirty-marking every freshly allocated slot.
//!
//! Indexes are 31-bit values (the high bit of an index word is the node
//! kind tag upstream); minting past `MAX_INDEX` fails.
//!
//! ## Freshness
//!
//! `empty()` reports whether the data file was created by this open. A
//! fresh store starts with a zeroed block 0 and an empty free list. A
//! non-empty data file whose meta file is missing is a hard error: the
//! free list and append cursor cannot be reconstructed from data blocks.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use crate::config::MAX_INDEX;

#[derive(Debug)]
pub struct BlockFile {
    data: File,
    data_path: PathBuf,
    meta_path: PathBuf,
    block_bytes: usize,
    next_block: u32,
    free: Vec<u32>,
    fresh: bool,
}

impl BlockFile {
    /// Opens or creates the file pair. On fresh creation the data file
    /// gets a zeroed block 0 and the meta file an empty free list.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        data_path: P,
        meta_path: Q,
        block_bytes: usize,
    ) -> Result<Self> {
        let data_path = data_path.as_ref().to_path_buf();
        let meta_path = meta_path.as_ref().to_path_buf();
        ensure!(block_bytes > 0, "block size must be non-zero");

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)
            .wrap_err_with(|| format!("failed to open data file '{}'", data_path.display()))?;

        let data_len = data
            .metadata()
            .wrap_err_with(|| format!("failed to stat data file '{}'", data_path.display()))?
            .len();

        let mut file = Self {
            data,
            data_path,
            meta_path,
            block_bytes,
            next_block: 1,
            free: Vec::new(),
            fresh: data_len == 0,
        };

        if file.fresh {
            let zeroed = vec![0u8; block_bytes];
            file.write_block(0, &zeroed)?;
            file.flush_meta()?;
            debug!(path = %file.data_path.display(), "created block file");
        } else {
            file.load_meta()?;
            debug!(
                path = %file.data_path.display(),
                blocks = file.next_block,
                free = file.free.len(),
                "opened block file"
            );
        }

        Ok(file)
    }

    fn load_meta(&mut self) -> Result<()> {
        let raw = fs::read(&self.meta_path).wrap_err_with(|| {
            format!(
                "failed to read meta file '{}' (data file exists; the free list cannot be rebuilt)",
                self.meta_path.display()
            )
        })?;

        ensure!(
            raw.len() >= 8,
            "meta file '{}' truncated: {} bytes",
            self.meta_path.display(),
            raw.len()
        );

        let free_count = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        let expected = 8 + free_count * 4;
        ensure!(
            raw.len() == expected,
            "meta file '{}' malformed: {} bytes for {} free entries",
            self.meta_path.display(),
            raw.len(),
            free_count
        );

        self.free = raw[4..4 + free_count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        self.next_block = u32::from_le_bytes(raw[expected - 4..].try_into().unwrap());

        ensure!(
            self.next_block >= 1,
            "meta file '{}' malformed: next_block is 0",
            self.meta_path.display()
        );
        for &index in &self.free {
            ensure!(
                index >= 1 && index < self.next_block,
                "meta file '{}' malformed: free entry {} out of range",
                self.meta_path.display(),
                index
            );
        }

        Ok(())
    }

    /// Rewrites the meta file from the in-memory free list.
    pub fn flush_meta(&mut self) -> Result<()> {
        let mut raw = Vec::with_capacity(8 + self.free.len() * 4);
        raw.extend_from_slice(&(self.free.len() as u32).to_le_bytes());
        for &index in &self.free {
            raw.extend_from_slice(&index.to_le_bytes());
        }
        raw.extend_from_slice(&self.next_block.to_le_bytes());

        fs::write(&self.meta_path, &raw)
            .wrap_err_with(|| format!("failed to write meta file '{}'", self.meta_path.display()))
    }

    pub fn read_block(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() == self.block_bytes,
            "block buffer is {} bytes, expected {}",
            buf.len(),
            self.block_bytes
        );
        ensure!(
            index < self.next_block,
            "read of unallocated block {} ({} blocks allocated)",
            index,
            self.next_block
        );

        self.data
            .seek(SeekFrom::Start(index as u64 * self.block_bytes as u64))
            .and_then(|_| self.data.read_exact(buf))
            .wrap_err_with(|| {
                format!(
                    "failed to read block {} of '{}'",
                    index,
                    self.data_path.display()
                )
            })
    }

    pub fn write_block(&mut self, index: u32, buf: &[u8]) -> Result<()> {
        ensure!(
            buf.len() == self.block_bytes,
            "block buffer is {} bytes, expected {}",
            buf.len(),
            self.block_bytes
        );
        ensure!(
            index < self.next_block,
            "write of unallocated block {} ({} blocks allocated)",
            index,
            self.next_block
        );

        self.data
            .seek(SeekFrom::Start(index as u64 * self.block_bytes as u64))
            .and_then(|_| self.data.write_all(buf))
            .wrap_err_with(|| {
                format!(
                    "failed to write block {} of '{}'",
                    index,
                    self.data_path.display()
                )
            })
    }

    /// Hands out a block index, reusing a recycled block when one exists.
    /// The result is always >= 1; block 0 belongs to the root.
    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        ensure!(
            self.next_block < MAX_INDEX,
            "block index space exhausted at {} blocks",
            self.next_block
        );
        let index = self.next_block;
        self.next_block += 1;
        Ok(index)
    }

    /// Returns a block to the free list. The caller promises not to read
    /// it again until it is reallocated.
    pub fn recycle(&mut self, index: u32) -> Result<()> {
        ensure!(index != 0, "block 0 is the root slot and is never recycled");
        ensure!(
            index < self.next_block,
            "recycle of unallocated block {}",
            index
        );
        self.free.push(index);
        Ok(())
    }

    /// Count of all blocks ever minted, including recycled ones and the
    /// root block.
    pub fn size(&self) -> u64 {
        self.next_block as u64
    }

    /// True when the data file was created by this open.
    pub fn empty(&self) -> bool {
        self.fresh
    }

    pub fn free_list(&self) -> &[u32] {
        &self.free
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    /// Flushes the meta file and syncs data blocks to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_meta()?;
        self.data
            .sync_all()
            .wrap_err_with(|| format!("failed to sync data file '{}'", self.data_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_BLOCK: usize = 4096;

    fn open_test_file(dir: &Path) -> BlockFile {
        BlockFile::open(dir.join("t.dat"), dir.join("t.bin"), TEST_BLOCK).unwrap()
    }

    #[test]
    fn open_creates_zeroed_root_block_and_meta() {
        let dir = tempdir().unwrap();
        let file = open_test_file(dir.path());

        assert!(file.empty());
        assert_eq!(file.size(), 1);
        assert_eq!(fs::metadata(dir.path().join("t.dat")).unwrap().len(), TEST_BLOCK as u64);
        assert!(dir.path().join("t.bin").exists());
    }

    #[test]
    fn reopen_is_not_fresh() {
        let dir = tempdir().unwrap();
        drop(open_test_file(dir.path()));

        let file = open_test_file(dir.path());
        assert!(!file.empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        let index = file.allocate().unwrap();
        let mut block = vec![0u8; TEST_BLOCK];
        block[0] = 0xAB;
        block[TEST_BLOCK - 1] = 0xCD;
        file.write_block(index, &block).unwrap();

        let mut back = vec![0u8; TEST_BLOCK];
        file.read_block(index, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn allocate_never_returns_block_zero() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        for _ in 0..10 {
            assert!(file.allocate().unwrap() >= 1);
        }
    }

    #[test]
    fn allocate_reuses_recycled_blocks_before_appending() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        let a = file.allocate().unwrap();
        let b = file.allocate().unwrap();
        file.recycle(a).unwrap();
        file.recycle(b).unwrap();

        assert_eq!(file.allocate().unwrap(), b);
        assert_eq!(file.allocate().unwrap(), a);
        assert_eq!(file.allocate().unwrap(), 3);
    }

    #[test]
    fn size_counts_recycled_blocks() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        let a = file.allocate().unwrap();
        let _b = file.allocate().unwrap();
        file.recycle(a).unwrap();

        assert_eq!(file.size(), 3);
    }

    #[test]
    fn recycle_block_zero_is_rejected() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        let result = file.recycle(0);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("root slot"));
    }

    #[test]
    fn read_of_unallocated_block_is_rejected() {
        let dir = tempdir().unwrap();
        let mut file = open_test_file(dir.path());

        let mut buf = vec![0u8; TEST_BLOCK];
        assert!(file.read_block(5, &mut buf).is_err());
    }

    #[test]
    fn free_list_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut file = open_test_file(dir.path());
            let a = file.allocate().unwrap();
            let _b = file.allocate().unwrap();
            let c = file.allocate().unwrap();
            file.recycle(a).unwrap();
            file.recycle(c).unwrap();
            file.sync().unwrap();
        }

        let mut file = open_test_file(dir.path());
        assert_eq!(file.size(), 4);
        assert_eq!(file.free_list(), &[1, 3]);
        assert_eq!(file.allocate().unwrap(), 3);
    }

    #[test]
    fn missing_meta_with_existing_data_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let mut file = open_test_file(dir.path());
            let index = file.allocate().unwrap();
            file.write_block(index, &vec![7u8; TEST_BLOCK]).unwrap();
            file.sync().unwrap();
        }
        fs::remove_file(dir.path().join("t.bin")).unwrap();

        let result = BlockFile::open(dir.path().join("t.dat"), dir.path().join("t.bin"), TEST_BLOCK);
        assert!(result.is_err());
        assert!(format!("{:?}", result.unwrap_err()).contains("free list"));
    }

    #[test]
    fn malformed_meta_is_rejected() {
        let dir = tempdir().unwrap();
        drop(open_test_file(dir.path()));
        fs::write(dir.path().join("t.bin"), [1, 2, 3]).unwrap();

        let result = BlockFile::open(dir.path().join("t.dat"), dir.path().join("t.bin"), TEST_BLOCK);
        assert!(result.is_err());
    }
}
