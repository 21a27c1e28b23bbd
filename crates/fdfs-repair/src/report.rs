//! Findings and the per-run report.

use crate::freelist::FreeListOutcome;
use fdfs_error::FsckError;
use fdfs_ondisk::Superblock;
use fdfs_types::BlockNumber;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{info, warn};

// ── Finding taxonomy ────────────────────────────────────────────────────────

/// How a detected condition was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Corrected in place.
    AutoRepaired,
    /// Record had the wrong shape; the node was skipped.
    FormatError,
    /// Reported only: no safe repair exists.
    PolicyViolation,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoRepaired => write!(f, "auto_repaired"),
            Self::FormatError => write!(f, "format_error"),
            Self::PolicyViolation => write!(f, "policy_violation"),
        }
    }
}

/// One condition detected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub block: BlockNumber,
    pub kind: FindingKind,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} [{}] {}", self.block, self.kind, self.detail)
    }
}

/// Findings collected by one component, logged as they are recorded.
#[derive(Debug, Clone, Default)]
pub struct Findings {
    items: Vec<Finding>,
}

impl Findings {
    pub fn repaired(&mut self, block: BlockNumber, detail: impl Into<String>) {
        let detail = detail.into();
        info!(target: "fdfs::repair", block = block.0, %detail, "auto_repaired");
        self.push(block, FindingKind::AutoRepaired, detail);
    }

    pub fn format_error(&mut self, block: BlockNumber, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(target: "fdfs::repair", block = block.0, %detail, "format_error");
        self.push(block, FindingKind::FormatError, detail);
    }

    pub fn policy_violation(&mut self, block: BlockNumber, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(target: "fdfs::repair", block = block.0, %detail, "policy_violation");
        self.push(block, FindingKind::PolicyViolation, detail);
    }

    /// Record a recoverable error at the node where it was detected.
    pub(crate) fn reject(&mut self, err: &FsckError) {
        let block = BlockNumber(err.block().unwrap_or_default());
        let detail = match err {
            FsckError::Format { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        self.format_error(block, detail);
    }

    fn push(&mut self, block: BlockNumber, kind: FindingKind, detail: String) {
        self.items.push(Finding {
            block,
            kind,
            detail,
        });
    }

    pub fn extend(&mut self, other: Self) {
        self.items.extend(other.items);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.items.iter()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Finding> {
        self.items
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Outcome of a complete run.
#[derive(Debug, Clone, Serialize)]
pub struct FsckReport {
    /// Reference time every timestamp was clamped to.
    pub now: u64,
    /// Superblock as written back.
    pub superblock: Superblock,
    /// Blocks referenced by the reachable tree.
    #[serde(skip)]
    pub used: BTreeSet<BlockNumber>,
    pub used_count: usize,
    /// `None` when the root directory could not be decoded.
    pub free_list: Option<FreeListOutcome>,
    /// Records rewritten by the time audit.
    pub times_clamped: usize,
    pub findings: Vec<Finding>,
}

impl FsckReport {
    /// True if nothing had to be repaired or reported.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    /// Findings of one kind attributed to `block`.
    pub fn findings_at(
        &self,
        block: BlockNumber,
        kind: FindingKind,
    ) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(move |f| f.block == block && f.kind == kind)
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} used blocks, {} free, {} repaired, {} format errors, {} policy violations",
            self.used_count,
            self.free_list.as_ref().map_or(0, |fl| fl.free_blocks),
            self.count(FindingKind::AutoRepaired),
            self.count(FindingKind::FormatError),
            self.count(FindingKind::PolicyViolation),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_keep_order_and_kind() {
        let mut findings = Findings::default();
        findings.repaired(BlockNumber(26), "uid 0 -> 1000");
        findings.policy_violation(BlockNumber(30), "size too large");
        findings.reject(&FsckError::Format {
            block: 31,
            detail: "bad shape".into(),
        });

        let items = findings.into_vec();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, FindingKind::AutoRepaired);
        assert_eq!(items[1].kind, FindingKind::PolicyViolation);
        assert_eq!(
            items[2],
            Finding {
                block: BlockNumber(31),
                kind: FindingKind::FormatError,
                detail: "bad shape".into(),
            }
        );
        assert_eq!(items[2].to_string(), "block 31 [format_error] bad shape");
    }

    #[test]
    fn report_json_omits_used_set() {
        let mut findings = Findings::default();
        findings.policy_violation(BlockNumber(40), "size 1 does not fit 2 data blocks");
        let report = FsckReport {
            now: 1000,
            superblock: Superblock::for_layout(&fdfs_types::Layout::DEFAULT, 10),
            used: [BlockNumber(26), BlockNumber(27)].into_iter().collect(),
            used_count: 2,
            free_list: None,
            times_clamped: 0,
            findings: findings.into_vec(),
        };

        let json = serde_json::to_value(&report).expect("serialize");
        assert!(json.get("used").is_none());
        assert_eq!(json["used_count"], 2);
        assert!(json["free_list"].is_null());
        assert_eq!(json["findings"][0]["kind"], "policy_violation");
        assert_eq!(json["superblock"]["device_id"], 20);
        assert_eq!(
            report.to_string(),
            "2 used blocks, 0 free, 0 repaired, 0 format errors, 1 policy violations"
        );
    }
}
