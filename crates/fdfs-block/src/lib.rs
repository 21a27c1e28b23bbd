#![forbid(unsafe_code)]
//! Block access layer.
//!
//! Provides the `BlockStore` trait and its implementations: one storage unit
//! per block number in an image directory, an in-memory store for tests and
//! fixtures, and a write overlay used for dry runs.

use fdfs_error::{FsckError, Result};
use fdfs_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Prefix of each storage unit's file name inside an image directory.
pub const UNIT_PREFIX: &str = "fusedata";

/// Owned block content.
///
/// Invariant: length <= block size of the originating store. Units are not
/// required to be full; a never-written unit reads as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Block-addressed storage.
///
/// Every call is a complete read, replace, or truncate of one unit.
pub trait BlockStore: Send + Sync {
    /// Read the full content of a unit.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Replace the content of a unit. `data.len()` MUST NOT exceed `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Empty a unit, creating it if it does not exist.
    fn truncate_block(&self, block: BlockNumber) -> Result<()>;

    /// Unit size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;
}

fn check_range(block: BlockNumber, count: u64) -> Result<()> {
    if block.0 >= count {
        return Err(FsckError::OutOfRange {
            block: block.0,
            count,
        });
    }
    Ok(())
}

fn check_len(block: BlockNumber, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(FsckError::Oversized {
            block: block.0,
            len,
            max,
        });
    }
    Ok(())
}

/// Image stored as one file per block: `<dir>/fusedata.<n>`.
#[derive(Debug, Clone)]
pub struct DirBlockStore {
    dir: PathBuf,
    block_size: usize,
    block_count: u64,
}

impl DirBlockStore {
    pub fn open(dir: impl AsRef<Path>, block_size: usize, block_count: u64) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = fs::metadata(dir)?;
        if !meta.is_dir() {
            return Err(FsckError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("image path {} is not a directory", dir.display()),
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            block_size,
            block_count,
        })
    }

    /// Path of the unit backing `block`.
    #[must_use]
    pub fn unit_path(&self, block: BlockNumber) -> PathBuf {
        self.dir.join(format!("{UNIT_PREFIX}.{}", block.0))
    }
}

impl BlockStore for DirBlockStore {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.block_count)?;
        match fs::read(self.unit_path(block)) {
            Ok(bytes) => Ok(BlockBuf::new(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BlockBuf::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_range(block, self.block_count)?;
        check_len(block, data.len(), self.block_size)?;
        fs::write(self.unit_path(block), data)?;
        Ok(())
    }

    fn truncate_block(&self, block: BlockNumber) -> Result<()> {
        check_range(block, self.block_count)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.unit_path(block))?;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// In-memory store. Units that were never written read as empty.
#[derive(Debug)]
pub struct MemBlockStore {
    blocks: Mutex<BTreeMap<BlockNumber, Vec<u8>>>,
    block_size: usize,
    block_count: u64,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            block_size,
            block_count,
        }
    }

    /// Copy of every unit that has been written, keyed by block number.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<BlockNumber, Vec<u8>> {
        self.blocks.lock().clone()
    }

    /// Read a unit without the range check, for assertions in tests.
    #[must_use]
    pub fn get(&self, block: BlockNumber) -> Vec<u8> {
        self.blocks.lock().get(&block).cloned().unwrap_or_default()
    }
}

impl BlockStore for MemBlockStore {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.block_count)?;
        Ok(BlockBuf::new(self.get(block)))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_range(block, self.block_count)?;
        check_len(block, data.len(), self.block_size)?;
        self.blocks.lock().insert(block, data.to_vec());
        Ok(())
    }

    fn truncate_block(&self, block: BlockNumber) -> Result<()> {
        check_range(block, self.block_count)?;
        self.blocks.lock().insert(block, Vec::new());
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

/// Write overlay for dry runs.
///
/// Writes and truncates are kept in memory and shadow the base store for
/// later reads; the base store is only ever read.
#[derive(Debug)]
pub struct OverlayStore<S: BlockStore> {
    base: S,
    overlay: Mutex<BTreeMap<BlockNumber, Vec<u8>>>,
}

impl<S: BlockStore> OverlayStore<S> {
    #[must_use]
    pub fn new(base: S) -> Self {
        Self {
            base,
            overlay: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn base(&self) -> &S {
        &self.base
    }

    /// Number of units whose overlaid content differs from the base store.
    pub fn pending_writes(&self) -> Result<usize> {
        let overlay = self.overlay.lock().clone();
        let mut changed = 0;
        for (block, bytes) in &overlay {
            if self.base.read_block(*block)?.as_slice() != bytes.as_slice() {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

impl<S: BlockStore> BlockStore for OverlayStore<S> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_range(block, self.block_count())?;
        if let Some(bytes) = self.overlay.lock().get(&block).cloned() {
            return Ok(BlockBuf::new(bytes));
        }
        self.base.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_range(block, self.block_count())?;
        check_len(block, data.len(), self.block_size())?;
        self.overlay.lock().insert(block, data.to_vec());
        Ok(())
    }

    fn truncate_block(&self, block: BlockNumber) -> Result<()> {
        check_range(block, self.block_count())?;
        self.overlay.lock().insert(block, Vec::new());
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.base.block_size()
    }

    fn block_count(&self) -> u64 {
        self.base.block_count()
    }
}
