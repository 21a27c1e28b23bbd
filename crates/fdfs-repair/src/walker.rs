//! Structural pass over the directory tree.
//!
//! Starting at the root, every reachable directory and file inode is decoded,
//! repaired in place where a safe repair exists, and added to the used-block
//! set. A node that cannot be decoded is reported and skipped together with
//! everything below it, which leaves its blocks out of the used set.

use crate::report::Findings;
use crate::{format_error, store_record};
use fdfs_block::BlockStore;
use fdfs_error::{FsckError, Result};
use fdfs_ondisk::dir::{PARENT_NAME, SELF_NAME};
use fdfs_ondisk::{
    DirEntry, DirectoryRecord, EntryKind, FileInode, LocationContent, classify_location,
};
use fdfs_types::{BlockNumber, Layout, Ownership};
use std::collections::BTreeSet;
use tracing::trace;

pub struct TreeWalker<'a> {
    store: &'a dyn BlockStore,
    layout: Layout,
    visited: BTreeSet<BlockNumber>,
    findings: Findings,
}

impl<'a> TreeWalker<'a> {
    pub fn new(store: &'a dyn BlockStore, layout: Layout) -> Self {
        Self {
            store,
            layout,
            visited: BTreeSet::new(),
            findings: Findings::default(),
        }
    }

    #[must_use]
    pub fn findings(&self) -> &Findings {
        &self.findings
    }

    #[must_use]
    pub fn into_findings(self) -> Findings {
        self.findings
    }

    /// Check and repair the directory at `block`, then everything below it.
    ///
    /// `parent` is the block the traversal arrived from; for the root it is
    /// the root itself. Children that check out are added to `used`; the
    /// caller decides whether `block` itself is added.
    ///
    /// A directory that cannot be decoded, or that was already visited in
    /// this walk, is returned as [`FsckError::Format`]. Errors below it are
    /// recorded as findings and do not stop the walk.
    pub fn walk_directory(
        &mut self,
        block: BlockNumber,
        parent: BlockNumber,
        used: &mut BTreeSet<BlockNumber>,
    ) -> Result<()> {
        if !self.visited.insert(block) {
            return Err(FsckError::Format {
                block: block.0,
                detail: "directory reached more than once, not descending again".into(),
            });
        }
        trace!(target: "fdfs::walker", block = block.0, parent = parent.0, "walk_directory");

        let raw = self.store.read_block(block)?;
        let mut dir = DirectoryRecord::parse(raw.as_slice(), &self.layout)
            .map_err(|err| format_error(block, "directory", &err))?;

        enforce_ownership(
            &mut self.findings,
            block,
            Ownership::DIRECTORY,
            [&mut dir.uid, &mut dir.gid, &mut dir.mode],
        );

        let mut entries = Vec::with_capacity(dir.entries.len() + 2);
        let mut seen_self = false;
        let mut seen_parent = false;
        for mut entry in std::mem::take(&mut dir.entries) {
            if entry.is_dot() {
                let (seen, target) = if entry.is_self() {
                    (&mut seen_self, block)
                } else {
                    (&mut seen_parent, parent)
                };
                if *seen {
                    self.findings
                        .repaired(block, format!("dropped duplicate entry {entry}"));
                    continue;
                }
                *seen = true;
                if entry.block != target || entry.kind != EntryKind::Directory {
                    self.findings.repaired(
                        block,
                        format!("entry {entry} -> d:{}:{target}", entry.name),
                    );
                    entry.block = target;
                    entry.kind = EntryKind::Directory;
                }
                entries.push(entry);
                continue;
            }

            let child = entry.block;
            let outcome = match entry.kind {
                EntryKind::Directory => self.walk_directory(child, block, used),
                EntryKind::File => self.check_file_inode(child, used),
            };
            match outcome {
                Ok(()) => {
                    used.insert(child);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => self.findings.reject(&err),
            }
            entries.push(entry);
        }

        if !seen_self {
            self.findings
                .repaired(block, format!("missing entry, added d:{SELF_NAME}:{block}"));
            entries.insert(0, DirEntry::new(EntryKind::Directory, SELF_NAME, block));
        }
        if !seen_parent {
            let at = entries
                .iter()
                .position(DirEntry::is_self)
                .map_or(0, |pos| pos + 1);
            self.findings.repaired(
                block,
                format!("missing entry, added d:{PARENT_NAME}:{parent}"),
            );
            entries.insert(at, DirEntry::new(EntryKind::Directory, PARENT_NAME, parent));
        }

        let linkcount = entries.len() as u64;
        if dir.linkcount != linkcount {
            self.findings
                .repaired(block, format!("linkcount {} -> {linkcount}", dir.linkcount));
            dir.linkcount = linkcount;
        }
        dir.entries = entries;

        store_record(
            self.store,
            &mut self.findings,
            block,
            "directory",
            raw.as_slice(),
            dir.encode(self.layout.block_size),
        )
    }

    /// Check and repair the file inode at `block` and its data layout.
    ///
    /// On success the inode's location block and, for indirect files, every
    /// data block are added to `used`. On failure nothing is added.
    pub fn check_file_inode(
        &mut self,
        block: BlockNumber,
        used: &mut BTreeSet<BlockNumber>,
    ) -> Result<()> {
        trace!(target: "fdfs::walker", block = block.0, "check_file_inode");

        let raw = self.store.read_block(block)?;
        let mut inode = FileInode::parse(raw.as_slice(), &self.layout)
            .map_err(|err| format_error(block, "file inode", &err))?;

        enforce_ownership(
            &mut self.findings,
            block,
            Ownership::FILE,
            [&mut inode.uid, &mut inode.gid, &mut inode.mode],
        );
        if inode.linkcount < 1 {
            self.findings
                .repaired(block, format!("linkcount {} -> 1", inode.linkcount));
            inode.linkcount = 1;
        }

        let location = inode.location;
        let content = self.store.read_block(location)?;
        let content = classify_location(content.as_slice(), &self.layout)
            .map_err(|err| format_error(block, "file location", &err))?;

        let mut claimed = vec![location];
        match content {
            LocationContent::Direct(mut payload) => {
                self.set_indirect(&mut inode, block, false);
                let max = self.layout.max_direct_payload();
                if payload.len() > max {
                    self.findings.repaired(
                        location,
                        format!("direct data truncated from {} to {max} bytes", payload.len()),
                    );
                    payload.truncate(max);
                    self.store.write_block(location, &payload)?;
                }
                let size = payload.len() as u64;
                if inode.size != size {
                    self.findings
                        .repaired(block, format!("size {} -> {size}", inode.size));
                    inode.size = size;
                }
            }
            LocationContent::Indirect(blocks) => {
                self.set_indirect(&mut inode, block, true);
                let block_size = self.layout.block_size as u64;
                let count = blocks.len() as u64;
                let low = block_size.saturating_mul(count - 1);
                let high = block_size.saturating_mul(count);
                if inode.size <= low || inode.size > high {
                    self.findings.policy_violation(
                        block,
                        format!(
                            "size {} does not fit {count} data blocks, expected ({low}, {high}]",
                            inode.size
                        ),
                    );
                }
                claimed.extend(blocks);
            }
        }

        store_record(
            self.store,
            &mut self.findings,
            block,
            "file inode",
            raw.as_slice(),
            inode.encode(self.layout.block_size),
        )?;
        used.extend(claimed);
        Ok(())
    }

    fn set_indirect(&mut self, inode: &mut FileInode, block: BlockNumber, indirect: bool) {
        if inode.indirect != indirect {
            self.findings.repaired(
                block,
                format!(
                    "indirect {} -> {}",
                    u8::from(inode.indirect),
                    u8::from(indirect)
                ),
            );
            inode.indirect = indirect;
        }
    }
}

fn enforce_ownership(
    findings: &mut Findings,
    block: BlockNumber,
    want: Ownership,
    [uid, gid, mode]: [&mut u64; 3],
) {
    for (field, value, expected) in [
        ("uid", uid, want.uid),
        ("gid", gid, want.gid),
        ("mode", mode, want.mode),
    ] {
        if *value != expected {
            findings.repaired(block, format!("{field} {value} -> {expected}"));
            *value = expected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FindingKind;
    use fdfs_block::MemBlockStore;
    use fdfs_types::BLOCK_SIZE;

    const ROOT: BlockNumber = BlockNumber(26);

    fn dir_record(uid: u64, linkcount: u64, entries: &str) -> String {
        format!(
            "{{size:0,uid:{uid},gid:1000,mode:16877,atime:100,ctime:100,mtime:100,linkcount:{linkcount}{{{entries}}}}}"
        )
    }

    fn inode_record(size: u64, linkcount: u64, indirect: u8, location: u64) -> String {
        format!(
            "size:{size},uid:1,gid:1,mode:33261,linkcount:{linkcount},atime:100,ctime:100,mtime:100,{{ indirect:{indirect} location:{location}}}"
        )
    }

    fn seed(blocks: &[(u64, &[u8])]) -> MemBlockStore {
        let store = MemBlockStore::new(BLOCK_SIZE, 100);
        for (block, raw) in blocks {
            store
                .write_block(BlockNumber(*block), raw)
                .expect("seed block");
        }
        store
    }

    fn walk(store: &MemBlockStore) -> (BTreeSet<BlockNumber>, Findings) {
        let mut walker = TreeWalker::new(store, Layout::DEFAULT.with_max_blocks(100));
        let mut used = BTreeSet::new();
        walker
            .walk_directory(ROOT, ROOT, &mut used)
            .expect("root walk");
        (used, walker.into_findings())
    }

    fn blocks(list: &[u64]) -> BTreeSet<BlockNumber> {
        list.iter().copied().map(BlockNumber).collect()
    }

    #[test]
    fn healthy_tree_collects_used_blocks() {
        let root = dir_record(1000, 4, "d:.:26, d:..:26, f:a.txt:27, d:sub:29");
        let file = inode_record(5, 1, 0, 28);
        let sub = dir_record(1000, 2, "d:.:29, d:..:26");
        let store = seed(&[
            (26, root.as_bytes()),
            (27, file.as_bytes()),
            (28, b"hello"),
            (29, sub.as_bytes()),
        ]);

        let (used, findings) = walk(&store);
        assert_eq!(used, blocks(&[27, 28, 29]));
        assert!(findings.is_empty(), "{:?}", findings.into_vec());
        let dir = DirectoryRecord::parse(&store.get(ROOT), &Layout::DEFAULT).expect("root");
        assert_eq!(dir.linkcount, 4);
    }

    #[test]
    fn repairs_self_and_parent_entries() {
        let root = dir_record(1000, 3, "d:.:26, d:..:26, d:sub:27");
        // Wrong `.`, duplicated `.`, missing `..`, bad owner and linkcount.
        let sub = dir_record(0, 9, "f:.:40, d:.:27, d:x:26");
        let store = seed(&[(26, root.as_bytes()), (27, sub.as_bytes())]);

        let (used, findings) = walk(&store);

        let dir = DirectoryRecord::parse(&store.get(BlockNumber(27)), &Layout::DEFAULT)
            .expect("sub");
        let names: Vec<_> = dir.entries.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["d:.:27", "d:..:26", "d:x:26"]);
        assert_eq!(dir.linkcount, 3);
        assert_eq!(dir.uid, 1000);
        // `x` points back at the root, which was already visited.
        assert!(
            findings
                .iter()
                .any(|f| f.block == ROOT && f.kind == FindingKind::FormatError)
        );
        assert_eq!(used, blocks(&[27]));
    }

    #[test]
    fn undecodable_child_is_skipped_and_not_used() {
        let root = dir_record(1000, 4, "d:.:26, d:..:26, f:bad:27, f:good:28");
        let good = inode_record(2, 1, 0, 29);
        let store = seed(&[
            (26, root.as_bytes()),
            (27, b"size:1,uid:1"),
            (28, good.as_bytes()),
            (29, b"ok"),
        ]);

        let (used, findings) = walk(&store);
        assert_eq!(used, blocks(&[28, 29]));
        let errors: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::FormatError)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].block, BlockNumber(27));
        // The entry itself stays in the directory.
        let dir = DirectoryRecord::parse(&store.get(ROOT), &Layout::DEFAULT).expect("root");
        assert_eq!(dir.entries.len(), 4);
    }

    #[test]
    fn direct_file_flag_size_and_linkcount_are_repaired() {
        let root = dir_record(1000, 3, "d:.:26, d:..:26, f:a:27");
        let file = inode_record(999, 0, 1, 28);
        let store = seed(&[(26, root.as_bytes()), (27, file.as_bytes()), (28, b"abc")]);

        let (_, findings) = walk(&store);
        let inode = FileInode::parse(&store.get(BlockNumber(27)), &Layout::DEFAULT).expect("inode");
        assert!(!inode.indirect);
        assert_eq!(inode.size, 3);
        assert_eq!(inode.linkcount, 1);
        assert_eq!(findings.len(), 3);
    }

    #[test]
    fn oversized_direct_payload_is_truncated() {
        let root = dir_record(1000, 3, "d:.:26, d:..:26, f:a:27");
        let file = inode_record(BLOCK_SIZE as u64, 1, 0, 28);
        let payload = vec![b'x'; BLOCK_SIZE];
        let store = seed(&[(26, root.as_bytes()), (27, file.as_bytes()), (28, &payload)]);

        walk(&store);
        assert_eq!(store.get(BlockNumber(28)).len(), BLOCK_SIZE - 1);
        let inode = FileInode::parse(&store.get(BlockNumber(27)), &Layout::DEFAULT).expect("inode");
        assert_eq!(inode.size, BLOCK_SIZE as u64 - 1);
    }

    #[test]
    fn indirect_size_outside_bounds_is_reported_not_changed() {
        let root = dir_record(1000, 4, "d:.:26, d:..:26, f:ok:27, f:big:28");
        let ok = inode_record(2 * BLOCK_SIZE as u64 + 100, 1, 0, 30);
        let big = inode_record(10 * BLOCK_SIZE as u64, 1, 1, 30);
        let store = seed(&[
            (26, root.as_bytes()),
            (27, ok.as_bytes()),
            (28, big.as_bytes()),
            (30, b"40, 41, 42"),
        ]);

        let (used, findings) = walk(&store);
        assert!(used.is_superset(&blocks(&[27, 28, 30, 40, 41, 42])));

        let ok = FileInode::parse(&store.get(BlockNumber(27)), &Layout::DEFAULT).expect("ok");
        assert!(ok.indirect);
        let big = FileInode::parse(&store.get(BlockNumber(28)), &Layout::DEFAULT).expect("big");
        assert_eq!(big.size, 10 * BLOCK_SIZE as u64);

        let violations: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::PolicyViolation)
            .collect();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].block, BlockNumber(28));
    }

    #[test]
    fn ambiguous_location_is_a_format_error() {
        let root = dir_record(1000, 3, "d:.:26, d:..:26, f:a:27");
        let file = inode_record(1, 1, 0, 28);
        let store = seed(&[(26, root.as_bytes()), (27, file.as_bytes()), (28, b"7")]);

        let (used, findings) = walk(&store);
        assert!(used.is_empty());
        assert_eq!(
            findings.iter().next().map(|f| (f.block, f.kind)),
            Some((BlockNumber(27), FindingKind::FormatError))
        );
    }

    #[test]
    fn undecodable_root_is_returned_to_caller() {
        let store = seed(&[(26, b"garbage")]);
        let mut walker = TreeWalker::new(&store, Layout::DEFAULT.with_max_blocks(100));
        let err = walker
            .walk_directory(ROOT, ROOT, &mut BTreeSet::new())
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.block(), Some(26));
    }
}
