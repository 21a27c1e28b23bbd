//! Free-list validation and reconciliation.
//!
//! The declared free list is read for reporting only. Reconciliation is a
//! full recompute from the used-block set: every candidate block that the
//! tree walk did not claim is free, its storage is emptied, and the 25
//! free-list blocks are rewritten from scratch.

use crate::report::Findings;
use fdfs_block::BlockStore;
use fdfs_error::Result;
use fdfs_ondisk::{encode_block_list, parse_block_list};
use fdfs_types::{BlockNumber, Layout};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// How many block numbers to quote in an aggregated finding.
const SAMPLE_LEN: usize = 8;

/// Summary of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeListOutcome {
    /// Blocks recorded as free after the rewrite.
    pub free_blocks: usize,
    /// Blocks the image declared free before the rewrite.
    pub declared_free: usize,
    /// Declared free but referenced by the tree.
    pub declared_but_used: usize,
    /// Free but absent from the declared list.
    pub missing_from_list: usize,
    /// Declared free but outside the allocatable range.
    pub declared_out_of_range: usize,
}

pub struct FreeListReconciler<'a> {
    store: &'a dyn BlockStore,
    layout: Layout,
}

impl<'a> FreeListReconciler<'a> {
    pub fn new(store: &'a dyn BlockStore, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Union of all free-list blocks as currently stored.
    ///
    /// A free-list block that cannot be decoded contributes nothing; it is
    /// rewritten by [`Self::reconcile`] anyway.
    pub fn read_declared(&self) -> Result<BTreeSet<BlockNumber>> {
        let mut declared = BTreeSet::new();
        for list_block in self.layout.free_list_blocks() {
            let raw = self.store.read_block(list_block)?;
            match parse_block_list(raw.as_slice(), &self.layout) {
                Ok(blocks) => declared.extend(blocks),
                Err(err) => warn!(
                    target: "fdfs::freelist",
                    block = list_block.0,
                    error = %err,
                    "free_list_block_unreadable"
                ),
            }
        }
        Ok(declared)
    }

    /// Recompute the free set from `used` and rewrite the free list.
    pub fn reconcile(
        &self,
        used: &BTreeSet<BlockNumber>,
        findings: &mut Findings,
    ) -> Result<FreeListOutcome> {
        let declared = self.read_declared()?;
        let free: BTreeSet<BlockNumber> = self
            .layout
            .data_range()
            .map(BlockNumber)
            .filter(|block| !used.contains(block))
            .collect();

        let mut lists: BTreeMap<BlockNumber, Vec<BlockNumber>> = self
            .layout
            .free_list_blocks()
            .map(|block| (block, Vec::new()))
            .collect();
        let last = BlockNumber(self.layout.free_end);
        for &block in &free {
            let slot = self.layout.free_list_slot(block).unwrap_or(last);
            lists.entry(slot).or_default().push(block);
        }

        for &block in &free {
            self.store.truncate_block(block)?;
        }
        for (list_block, members) in &lists {
            debug!(
                target: "fdfs::freelist",
                block = list_block.0,
                members = members.len(),
                "free_list_block_written"
            );
            self.store
                .write_block(*list_block, &encode_block_list(members))?;
        }

        let list_block = BlockNumber(self.layout.free_start);
        let declared_but_used: Vec<_> = declared.intersection(used).copied().collect();
        let missing: Vec<_> = free.difference(&declared).copied().collect();
        let data_range = self.layout.data_range();
        let out_of_range: Vec<_> = declared
            .iter()
            .copied()
            .filter(|block| !data_range.contains(&block.0))
            .collect();
        for (blocks, what) in [
            (&declared_but_used, "declared free but in use"),
            (&missing, "free but missing from the free list"),
            (&out_of_range, "declared free but not allocatable"),
        ] {
            if !blocks.is_empty() {
                findings.repaired(
                    list_block,
                    format!("{} blocks {what}: {}", blocks.len(), sample(blocks)),
                );
            }
        }

        Ok(FreeListOutcome {
            free_blocks: free.len(),
            declared_free: declared.len(),
            declared_but_used: declared_but_used.len(),
            missing_from_list: missing.len(),
            declared_out_of_range: out_of_range.len(),
        })
    }
}

fn sample(blocks: &[BlockNumber]) -> String {
    let mut out = blocks
        .iter()
        .take(SAMPLE_LEN)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if blocks.len() > SAMPLE_LEN {
        out.push_str(", ...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdfs_block::MemBlockStore;
    use fdfs_types::BLOCK_SIZE;

    fn small_layout() -> Layout {
        // Data blocks 27..60, all recorded in free-list block 1.
        Layout::DEFAULT.with_max_blocks(60)
    }

    #[test]
    fn reconcile_rewrites_complement_of_used() {
        let layout = small_layout();
        let store = MemBlockStore::new(BLOCK_SIZE, layout.max_blocks);
        store
            .write_block(BlockNumber(1), b"5, 26, 27, 28, 29, 30")
            .expect("seed free list");
        store
            .write_block(BlockNumber(40), b"stale data")
            .expect("seed stale block");

        let used: BTreeSet<_> = [27, 28, 31].into_iter().map(BlockNumber).collect();
        let mut findings = Findings::default();
        let outcome = FreeListReconciler::new(&store, layout)
            .reconcile(&used, &mut findings)
            .expect("reconcile");

        assert_eq!(outcome.free_blocks, 33 - 3);
        assert_eq!(outcome.declared_free, 6);
        assert_eq!(outcome.declared_but_used, 2);
        assert_eq!(outcome.missing_from_list, 30 - 2);
        // A free-list block and the root are never allocatable.
        assert_eq!(outcome.declared_out_of_range, 2);

        let listed = parse_block_list(&store.get(BlockNumber(1)), &layout).expect("list");
        let expected: Vec<_> = (27..60)
            .map(BlockNumber)
            .filter(|b| !used.contains(b))
            .collect();
        assert_eq!(listed, expected);
        for list_block in 2..=25 {
            assert!(store.get(BlockNumber(list_block)).is_empty());
        }
        assert!(store.get(BlockNumber(40)).is_empty());
        assert_eq!(findings.len(), 3);
        assert!(
            findings
                .iter()
                .any(|f| f.detail == "2 blocks declared free but not allocatable: 5, 26")
        );
    }

    #[test]
    fn partition_spreads_across_list_blocks() {
        let layout = Layout::DEFAULT.with_max_blocks(1_000);
        let store = MemBlockStore::new(BLOCK_SIZE, layout.max_blocks);
        let used = BTreeSet::new();

        FreeListReconciler::new(&store, layout)
            .reconcile(&used, &mut Findings::default())
            .expect("reconcile");

        let first = parse_block_list(&store.get(BlockNumber(1)), &layout).expect("list 1");
        let second = parse_block_list(&store.get(BlockNumber(2)), &layout).expect("list 2");
        let third = parse_block_list(&store.get(BlockNumber(3)), &layout).expect("list 3");
        assert_eq!(first.first(), Some(&BlockNumber(27)));
        assert_eq!(first.last(), Some(&BlockNumber(399)));
        assert_eq!(second.len(), 400);
        assert_eq!(third.last(), Some(&BlockNumber(999)));
    }

    #[test]
    fn unreadable_declared_list_is_ignored() {
        let layout = small_layout();
        let store = MemBlockStore::new(BLOCK_SIZE, layout.max_blocks);
        store
            .write_block(BlockNumber(3), b"garbage, 12")
            .expect("seed");
        store.write_block(BlockNumber(4), b"5, 30").expect("seed");

        let declared = FreeListReconciler::new(&store, layout)
            .read_declared()
            .expect("declared");
        assert_eq!(
            declared.into_iter().collect::<Vec<_>>(),
            [BlockNumber(5), BlockNumber(30)]
        );
    }
}
