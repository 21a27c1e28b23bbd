//! Timestamp audit.
//!
//! A second traversal, independent of the structural walk, that clamps
//! `atime`, `ctime` and `mtime` of every reachable directory and file inode to
//! the run's reference time. Records it cannot decode were already reported by
//! the structural pass and are skipped quietly.

use crate::report::Findings;
use crate::store_record;
use fdfs_block::BlockStore;
use fdfs_error::Result;
use fdfs_ondisk::{DirectoryRecord, EntryKind, FileInode};
use fdfs_types::{BlockNumber, Layout};
use std::collections::BTreeSet;
use tracing::debug;

pub struct TimeAuditor<'a> {
    store: &'a dyn BlockStore,
    layout: Layout,
    now: u64,
    visited: BTreeSet<BlockNumber>,
    findings: Findings,
    clamped: usize,
}

impl<'a> TimeAuditor<'a> {
    pub fn new(store: &'a dyn BlockStore, layout: Layout, now: u64) -> Self {
        Self {
            store,
            layout,
            now,
            visited: BTreeSet::new(),
            findings: Findings::default(),
            clamped: 0,
        }
    }

    /// Clamp every record reachable from the directory at `root`.
    pub fn audit(&mut self, root: BlockNumber) -> Result<()> {
        self.audit_directory(root)
    }

    /// Number of records rewritten so far.
    #[must_use]
    pub fn clamped(&self) -> usize {
        self.clamped
    }

    #[must_use]
    pub fn into_findings(self) -> Findings {
        self.findings
    }

    fn audit_directory(&mut self, block: BlockNumber) -> Result<()> {
        if !self.visited.insert(block) {
            return Ok(());
        }
        let raw = self.store.read_block(block)?;
        let mut dir = match DirectoryRecord::parse(raw.as_slice(), &self.layout) {
            Ok(dir) => dir,
            Err(err) => {
                debug!(target: "fdfs::times", block = block.0, error = %err, "time_audit_skipped");
                return Ok(());
            }
        };

        if self.clamp(block, [&mut dir.atime, &mut dir.ctime, &mut dir.mtime]) {
            let encoded = dir.encode(self.layout.block_size);
            store_record(
                self.store,
                &mut self.findings,
                block,
                "directory",
                raw.as_slice(),
                encoded,
            )?;
        }

        for entry in dir.entries.iter().filter(|e| !e.is_dot()) {
            match entry.kind {
                EntryKind::Directory => self.audit_directory(entry.block)?,
                EntryKind::File => self.audit_file(entry.block)?,
            }
        }
        Ok(())
    }

    fn audit_file(&mut self, block: BlockNumber) -> Result<()> {
        if !self.visited.insert(block) {
            return Ok(());
        }
        let raw = self.store.read_block(block)?;
        let mut inode = match FileInode::parse(raw.as_slice(), &self.layout) {
            Ok(inode) => inode,
            Err(err) => {
                debug!(target: "fdfs::times", block = block.0, error = %err, "time_audit_skipped");
                return Ok(());
            }
        };

        if self.clamp(block, [&mut inode.atime, &mut inode.ctime, &mut inode.mtime]) {
            let encoded = inode.encode(self.layout.block_size);
            store_record(
                self.store,
                &mut self.findings,
                block,
                "file inode",
                raw.as_slice(),
                encoded,
            )?;
        }
        Ok(())
    }

    /// Returns true if any of the three times was moved back to `now`.
    fn clamp(&mut self, block: BlockNumber, [atime, ctime, mtime]: [&mut u64; 3]) -> bool {
        let mut changed = false;
        for (field, value) in [("atime", atime), ("ctime", ctime), ("mtime", mtime)] {
            if *value > self.now {
                self.findings.repaired(
                    block,
                    format!("{field} {value} is in the future, now {}", self.now),
                );
                *value = self.now;
                changed = true;
            }
        }
        if changed {
            self.clamped += 1;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdfs_block::MemBlockStore;
    use fdfs_types::BLOCK_SIZE;

    #[test]
    fn clamps_future_times_and_leaves_past_times() {
        let store = MemBlockStore::new(BLOCK_SIZE, 100);
        let root = "{size:0,uid:1000,gid:1000,mode:16877,atime:50,ctime:5000,mtime:50,linkcount:4{d:.:26, d:..:26, f:a:27, f:b:28}}";
        let future = "size:1,uid:1,gid:1,mode:33261,linkcount:1,atime:9000,ctime:9000,mtime:10,{ indirect:0 location:29}";
        let past = "size:1,uid:1,gid:1,mode:33261,linkcount:1,atime:10,ctime:10,mtime:10,{ indirect:0 location:30}";
        for (block, raw) in [(26, root), (27, future), (28, past)] {
            store
                .write_block(BlockNumber(block), raw.as_bytes())
                .expect("seed");
        }

        let mut auditor = TimeAuditor::new(&store, Layout::DEFAULT.with_max_blocks(100), 1000);
        auditor.audit(BlockNumber(26)).expect("audit");
        assert_eq!(auditor.clamped(), 2);
        assert_eq!(auditor.into_findings().len(), 3);

        let layout = Layout::DEFAULT;
        let dir = DirectoryRecord::parse(&store.get(BlockNumber(26)), &layout).expect("root");
        assert_eq!((dir.atime, dir.ctime, dir.mtime), (50, 1000, 50));
        let file = FileInode::parse(&store.get(BlockNumber(27)), &layout).expect("file");
        assert_eq!((file.atime, file.ctime, file.mtime), (1000, 1000, 10));
        // Untouched records are not rewritten.
        assert_eq!(store.get(BlockNumber(28)), past.as_bytes());
    }

    #[test]
    fn undecodable_records_are_skipped() {
        let store = MemBlockStore::new(BLOCK_SIZE, 100);
        let root = "{size:0,uid:1000,gid:1000,mode:16877,atime:1,ctime:1,mtime:1,linkcount:4{d:.:26, d:..:26, d:loop:26, f:bad:27}}";
        store
            .write_block(BlockNumber(26), root.as_bytes())
            .expect("seed");
        store.write_block(BlockNumber(27), b"junk").expect("seed");

        let mut auditor = TimeAuditor::new(&store, Layout::DEFAULT.with_max_blocks(100), 1000);
        auditor.audit(BlockNumber(26)).expect("audit");
        assert_eq!(auditor.clamped(), 0);
        assert!(auditor.into_findings().is_empty());
    }
}
