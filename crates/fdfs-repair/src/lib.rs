#![forbid(unsafe_code)]
//! Offline consistency checking and repair.
//!
//! A check runs five phases against a quiescent image:
//!
//! 1. device-id gate and superblock repair ([`superblock`])
//! 2. structural walk of the directory tree ([`walker`]), which collects
//!    the used-block set
//! 3. free-list reconciliation against that set ([`freelist`])
//! 4. an independent walk clamping timestamps ([`times`])
//!
//! [`Checker`] runs them in order and returns an [`FsckReport`].

pub mod checker;
pub mod freelist;
pub mod report;
pub mod superblock;
pub mod times;
pub mod walker;

pub use checker::{Checker, now_epoch_secs};
pub use freelist::{FreeListOutcome, FreeListReconciler};
pub use report::{Finding, FindingKind, Findings, FsckReport};
pub use superblock::SuperblockValidator;
pub use times::TimeAuditor;
pub use walker::TreeWalker;

use fdfs_block::BlockStore;
use fdfs_error::{FsckError, Result};
use fdfs_types::{BlockNumber, ParseError};

/// Attach the block a record was read from to a codec error.
pub(crate) fn format_error(block: BlockNumber, what: &str, err: &ParseError) -> FsckError {
    FsckError::Format {
        block: block.0,
        detail: format!("{what}: {err}"),
    }
}

/// Write an encoded record over `current`, or record why it could not be
/// encoded.
///
/// Nothing is written when the encoding already matches what is on disk. An
/// encoding failure leaves the block as it was and is not fatal.
pub(crate) fn store_record(
    store: &dyn BlockStore,
    findings: &mut Findings,
    block: BlockNumber,
    what: &str,
    current: &[u8],
    encoded: std::result::Result<Vec<u8>, ParseError>,
) -> Result<()> {
    match encoded {
        Ok(bytes) if bytes == current => Ok(()),
        Ok(bytes) => store.write_block(block, &bytes),
        Err(err) => {
            findings.format_error(block, format!("{what} not rewritten: {err}"));
            Ok(())
        }
    }
}
