#![forbid(unsafe_code)]
//! Error types for fdfs.
//!
//! # Error Taxonomy
//!
//! fdfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fdfs-types` | Text record violations detected by the codec |
//! | Runtime | `FsckError` | `fdfs-error` (this crate) | Errors surfaced by stores, the checker, and the CLI |
//!
//! `fdfs-error` does not depend on `fdfs-types`. A `ParseError` is lifted into
//! `FsckError::Format` by `fdfs-repair`, which knows the block number the
//! record was read from.
//!
//! ## Severity
//!
//! | Variant | Fatal | Handling |
//! |---------|-------|----------|
//! | `DeviceMismatch` | yes | run aborts before any write |
//! | `Superblock` | yes | run aborts before any write |
//! | `Io` | yes | run aborts |
//! | `OutOfRange` | yes | run aborts (store misuse) |
//! | `Oversized` | yes | run aborts (encoder bug or oversized payload) |
//! | `Format` | no | node skipped, traversal continues |
//!
//! ## Exit Codes
//!
//! Every variant maps to exactly one process exit code via
//! [`FsckError::exit_code`]. A completed run exits 0 whatever it found.

use thiserror::Error;

/// Exit code for a run that stopped on an operational or fatal error.
pub const EXIT_OPERATIONAL: i32 = 8;

/// Unified error type for fdfs operations.
#[derive(Debug, Error)]
pub enum FsckError {
    /// Operating system I/O error on a storage unit.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock names a device this build does not check.
    ///
    /// No other superblock field can be trusted once this fails, so the run
    /// stops without writing anything.
    #[error("device id mismatch: expected {expected}, found {found}")]
    DeviceMismatch { expected: u64, found: u64 },

    /// The superblock could not be decoded at all.
    #[error("unreadable superblock: {0}")]
    Superblock(String),

    /// A record does not have the shape its role requires.
    #[error("format error at block {block}: {detail}")]
    Format { block: u64, detail: String },

    /// A block number past the end of the store.
    #[error("block {block} out of range (block_count {count})")]
    OutOfRange { block: u64, count: u64 },

    /// Content longer than one storage unit.
    #[error("{len} bytes do not fit block {block} (block_size {max})")]
    Oversized { block: u64, len: usize, max: usize },
}

impl FsckError {
    /// True when the whole run must stop.
    ///
    /// Only `Format` is recovered locally by the tree walkers.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::DeviceMismatch { .. }
            | Self::Superblock(_)
            | Self::OutOfRange { .. }
            | Self::Oversized { .. } => true,
            Self::Format { .. } => false,
        }
    }

    /// Block the error is attributed to, when known.
    #[must_use]
    pub fn block(&self) -> Option<u64> {
        match self {
            Self::Format { block, .. }
            | Self::OutOfRange { block, .. }
            | Self::Oversized { block, .. } => Some(*block),
            Self::DeviceMismatch { .. } | Self::Superblock(_) => Some(0),
            Self::Io(_) => None,
        }
    }

    /// Process exit code for a run that ended with this error.
    ///
    /// The mapping is exhaustive so that a new variant cannot be added
    /// without choosing its exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_)
            | Self::DeviceMismatch { .. }
            | Self::Superblock(_)
            | Self::Format { .. }
            | Self::OutOfRange { .. }
            | Self::Oversized { .. } => EXIT_OPERATIONAL,
        }
    }
}

/// Result alias using `FsckError`.
pub type Result<T> = std::result::Result<T, FsckError>;
