#![forbid(unsafe_code)]
//! Fixture images for end-to-end checks.
//!
//! [`ImageFixture`] builds a consistent image from typed records (directories,
//! file inodes, data blocks) and computes the matching free list, so tests can
//! start from a healthy image and corrupt exactly the part they exercise.
//! [`load_image_fixture`] reads the JSON fixtures under `conformance/fixtures`.

use anyhow::{Context, Result, bail, ensure};
use fdfs_block::BlockStore;
use fdfs_ondisk::dir::{PARENT_NAME, SELF_NAME};
use fdfs_ondisk::{DirEntry, DirectoryRecord, EntryKind, FileInode, Superblock, encode_block_list};
use fdfs_types::{BlockNumber, Layout, Ownership};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Timestamp given to every fixture record unless a test overrides it.
pub const FIXTURE_TIME: u64 = 1_323_630_836;

#[derive(Debug, Clone)]
pub struct ImageFixture {
    layout: Layout,
    superblock: Superblock,
    dirs: BTreeMap<BlockNumber, DirectoryRecord>,
    inodes: BTreeMap<BlockNumber, FileInode>,
    data: BTreeMap<BlockNumber, Vec<u8>>,
    /// Written last, over anything else.
    raw: BTreeMap<BlockNumber, Vec<u8>>,
    compute_free_list: bool,
}

impl ImageFixture {
    /// Superblock plus an empty root directory.
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        let root = layout.root_block();
        let mut dirs = BTreeMap::new();
        dirs.insert(root, empty_directory(root, root));
        Self {
            layout,
            superblock: Superblock::for_layout(&layout, FIXTURE_TIME),
            dirs,
            inodes: BTreeMap::new(),
            data: BTreeMap::new(),
            raw: BTreeMap::new(),
            compute_free_list: true,
        }
    }

    /// Image made only of the given block contents. The free list is taken
    /// as given rather than computed.
    #[must_use]
    pub fn from_raw(layout: Layout, blocks: BTreeMap<BlockNumber, Vec<u8>>) -> Self {
        Self {
            layout,
            superblock: Superblock::for_layout(&layout, FIXTURE_TIME),
            dirs: BTreeMap::new(),
            inodes: BTreeMap::new(),
            data: BTreeMap::new(),
            raw: blocks,
            compute_free_list: false,
        }
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Add an empty subdirectory at `block` under `parent`.
    pub fn add_dir(&mut self, parent: BlockNumber, name: &str, block: BlockNumber) -> Result<()> {
        self.claim(block)?;
        self.link(parent, DirEntry::new(EntryKind::Directory, name, block))?;
        self.dirs.insert(block, empty_directory(block, parent));
        Ok(())
    }

    /// Add a single-block file whose payload lives at `data_block`.
    pub fn add_file(
        &mut self,
        parent: BlockNumber,
        name: &str,
        inode_block: BlockNumber,
        data_block: BlockNumber,
        payload: &[u8],
    ) -> Result<()> {
        ensure!(
            payload.len() <= self.layout.block_size,
            "payload of {} bytes does not fit one block",
            payload.len()
        );
        self.claim(inode_block)?;
        self.claim(data_block)?;
        self.link(parent, DirEntry::new(EntryKind::File, name, inode_block))?;
        self.inodes.insert(
            inode_block,
            file_inode(payload.len() as u64, false, data_block),
        );
        self.data.insert(data_block, payload.to_vec());
        Ok(())
    }

    /// Add a multi-block file: an index at `index_block` listing
    /// `data_blocks`, with the inode claiming `size` bytes.
    pub fn add_indirect_file(
        &mut self,
        parent: BlockNumber,
        name: &str,
        inode_block: BlockNumber,
        index_block: BlockNumber,
        data_blocks: &[BlockNumber],
        size: u64,
    ) -> Result<()> {
        ensure!(
            data_blocks.len() >= 2,
            "an index block lists at least two data blocks"
        );
        self.claim(inode_block)?;
        self.claim(index_block)?;
        for &block in data_blocks {
            self.claim(block)?;
        }
        self.link(parent, DirEntry::new(EntryKind::File, name, inode_block))?;
        self.inodes
            .insert(inode_block, file_inode(size, true, index_block));
        self.data.insert(index_block, encode_block_list(data_blocks));
        for &block in data_blocks {
            self.data.insert(block, vec![b'x'; self.layout.block_size]);
        }
        Ok(())
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    pub fn dir_mut(&mut self, block: BlockNumber) -> Result<&mut DirectoryRecord> {
        self.dirs
            .get_mut(&block)
            .with_context(|| format!("no directory at block {block}"))
    }

    pub fn inode_mut(&mut self, block: BlockNumber) -> Result<&mut FileInode> {
        self.inodes
            .get_mut(&block)
            .with_context(|| format!("no file inode at block {block}"))
    }

    /// Replace the content of `block` verbatim.
    pub fn set_raw(&mut self, block: BlockNumber, bytes: impl Into<Vec<u8>>) {
        self.raw.insert(block, bytes.into());
    }

    /// Keep the given free-list text instead of computing the free list.
    pub fn set_free_list(&mut self, lists: &[(BlockNumber, &[BlockNumber])]) {
        self.compute_free_list = false;
        for (list_block, members) in lists {
            self.raw.insert(*list_block, encode_block_list(members));
        }
    }

    /// Blocks the records of this fixture occupy in the data range.
    #[must_use]
    pub fn used_blocks(&self) -> BTreeSet<BlockNumber> {
        let range = self.layout.data_range();
        self.dirs
            .keys()
            .chain(self.inodes.keys())
            .chain(self.data.keys())
            .copied()
            .filter(|block| range.contains(&block.0))
            .collect()
    }

    /// The free set a correct image has: data range minus used blocks.
    #[must_use]
    pub fn expected_free(&self) -> BTreeSet<BlockNumber> {
        let used = self.used_blocks();
        self.layout
            .data_range()
            .map(BlockNumber)
            .filter(|block| !used.contains(block))
            .collect()
    }

    /// Write every block of the image into `store`.
    pub fn write_to(&self, store: &dyn BlockStore) -> Result<()> {
        let block_size = self.layout.block_size;
        store.write_block(BlockNumber::SUPERBLOCK, &self.superblock.encode(block_size)?)?;
        for (block, dir) in &self.dirs {
            store.write_block(*block, &dir.encode(block_size)?)?;
        }
        for (block, inode) in &self.inodes {
            store.write_block(*block, &inode.encode(block_size)?)?;
        }
        for (block, bytes) in &self.data {
            store.write_block(*block, bytes)?;
        }
        if self.compute_free_list {
            let mut lists: BTreeMap<BlockNumber, Vec<BlockNumber>> = self
                .layout
                .free_list_blocks()
                .map(|block| (block, Vec::new()))
                .collect();
            for block in self.expected_free() {
                let slot = self
                    .layout
                    .free_list_slot(block)
                    .unwrap_or(BlockNumber(self.layout.free_end));
                lists.entry(slot).or_default().push(block);
            }
            for (list_block, members) in &lists {
                store.write_block(*list_block, &encode_block_list(members))?;
            }
        }
        for (block, bytes) in &self.raw {
            store.write_block(*block, bytes)?;
        }
        Ok(())
    }

    fn claim(&self, block: BlockNumber) -> Result<()> {
        ensure!(
            self.layout.data_range().contains(&block.0),
            "block {block} is outside the data range"
        );
        if self.dirs.contains_key(&block)
            || self.inodes.contains_key(&block)
            || self.data.contains_key(&block)
        {
            bail!("block {block} is already in use");
        }
        Ok(())
    }

    fn link(&mut self, parent: BlockNumber, entry: DirEntry) -> Result<()> {
        let dir = self.dir_mut(parent)?;
        dir.entries.push(entry);
        dir.linkcount = dir.entries.len() as u64;
        Ok(())
    }
}

fn empty_directory(block: BlockNumber, parent: BlockNumber) -> DirectoryRecord {
    let owner = Ownership::DIRECTORY;
    DirectoryRecord {
        size: 0,
        uid: owner.uid,
        gid: owner.gid,
        mode: owner.mode,
        atime: FIXTURE_TIME,
        ctime: FIXTURE_TIME,
        mtime: FIXTURE_TIME,
        linkcount: 2,
        entries: vec![
            DirEntry::new(EntryKind::Directory, SELF_NAME, block),
            DirEntry::new(EntryKind::Directory, PARENT_NAME, parent),
        ],
    }
}

fn file_inode(size: u64, indirect: bool, location: BlockNumber) -> FileInode {
    let owner = Ownership::FILE;
    FileInode {
        size,
        uid: owner.uid,
        gid: owner.gid,
        mode: owner.mode,
        linkcount: 1,
        atime: FIXTURE_TIME,
        ctime: FIXTURE_TIME,
        mtime: FIXTURE_TIME,
        indirect,
        location,
    }
}

// ── JSON fixtures ───────────────────────────────────────────────────────────

/// On-disk form of a fixture image: block contents as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub max_blocks: u64,
    pub blocks: Vec<FixtureBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBlock {
    pub block: u64,
    pub text: String,
}

pub fn load_image_fixture(path: &Path) -> Result<ImageFixture> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let spec: ImageSpec = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;

    let layout = Layout::DEFAULT.with_max_blocks(spec.max_blocks);
    let mut blocks = BTreeMap::new();
    for FixtureBlock { block, text } in spec.blocks {
        ensure!(
            block < layout.max_blocks,
            "fixture block {block} out of range (max_blocks {})",
            layout.max_blocks
        );
        ensure!(
            text.len() <= layout.block_size,
            "fixture block {block} holds {} bytes",
            text.len()
        );
        if blocks.insert(BlockNumber(block), text.into_bytes()).is_some() {
            bail!("fixture block {block} listed twice");
        }
    }
    Ok(ImageFixture::from_raw(layout, blocks))
}
