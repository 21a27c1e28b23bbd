//! Phase orchestration.

use crate::freelist::FreeListReconciler;
use crate::report::{Findings, FsckReport};
use crate::superblock::SuperblockValidator;
use crate::times::TimeAuditor;
use crate::walker::TreeWalker;
use fdfs_block::BlockStore;
use fdfs_error::Result;
use fdfs_types::Layout;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, info_span, warn};

/// Seconds since the Unix epoch, or 0 if the clock is set before it.
#[must_use]
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Runs every phase of a check against one image.
pub struct Checker<'a> {
    store: &'a dyn BlockStore,
    layout: Layout,
}

impl<'a> Checker<'a> {
    pub fn new(store: &'a dyn BlockStore, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Check and repair the image, clamping every timestamp to `now`.
    ///
    /// Returns `Err` only for conditions that stop the run: a foreign or
    /// unreadable superblock, and storage failures. Everything else ends up
    /// in [`FsckReport::findings`].
    pub fn run(&self, now: u64) -> Result<FsckReport> {
        info!(
            target: "fdfs::check",
            now,
            max_blocks = self.layout.max_blocks,
            "fsck_start"
        );
        let mut findings = Findings::default();

        let superblock = {
            let _span = info_span!("superblock").entered();
            SuperblockValidator::new(self.store, self.layout)
                .validate_and_repair(now, &mut findings)?
        };

        let root = self.layout.root_block();
        let mut used = BTreeSet::new();
        let root_ok = {
            let _span = info_span!("walk", root = root.0).entered();
            let mut walker = TreeWalker::new(self.store, self.layout);
            let outcome = walker.walk_directory(root, root, &mut used);
            findings.extend(walker.into_findings());
            match outcome {
                Ok(()) => {
                    used.insert(root);
                    true
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    findings.reject(&err);
                    false
                }
            }
        };

        let free_list = if root_ok {
            let _span = info_span!("free_list", used = used.len()).entered();
            Some(FreeListReconciler::new(self.store, self.layout).reconcile(&used, &mut findings)?)
        } else {
            warn!(
                target: "fdfs::check",
                root = root.0,
                "free_list_left_unchanged_root_unreadable"
            );
            None
        };

        let times_clamped = {
            let _span = info_span!("times").entered();
            let mut auditor = TimeAuditor::new(self.store, self.layout, now);
            auditor.audit(root)?;
            let clamped = auditor.clamped();
            findings.extend(auditor.into_findings());
            clamped
        };

        let report = FsckReport {
            now,
            superblock,
            used_count: used.len(),
            used,
            free_list,
            times_clamped,
            findings: findings.into_vec(),
        };
        info!(
            target: "fdfs::check",
            used = report.used_count,
            findings = report.findings.len(),
            "fsck_complete"
        );
        Ok(report)
    }
}
