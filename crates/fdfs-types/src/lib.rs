#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Bytes per storage unit.
pub const BLOCK_SIZE: usize = 4096;
pub const MAX_NUM_BLOCKS: u64 = 10_000;
/// Device identity compiled into this build; images carrying any other id are rejected.
pub const DEV_ID: u64 = 20;
pub const FREE_START: u64 = 1;
pub const FREE_END: u64 = 25;
pub const ROOT: u64 = FREE_END + 1;
/// Block numbers covered by a single free-list block.
pub const BLOCKS_IN_FREE: u64 = 400;

/// Filler used to right-pad brace-terminated records to `BLOCK_SIZE`.
pub const PAD_BYTE: u8 = b'0';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    pub const SUPERBLOCK: Self = Self(0);
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expected owner and permission bits for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub uid: u64,
    pub gid: u64,
    pub mode: u64,
}

impl Ownership {
    /// `drwxr-xr-x` owned by 1000:1000.
    pub const DIRECTORY: Self = Self {
        uid: 1000,
        gid: 1000,
        mode: 16877,
    };

    /// `-rwxr-xr-x` owned by 1:1.
    pub const FILE: Self = Self {
        uid: 1,
        gid: 1,
        mode: 33261,
    };
}

/// Fixed geometry of an image.
///
/// Production images always use [`Layout::DEFAULT`]. The value is threaded
/// through every component rather than read from globals so that small
/// images can be built for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub block_size: usize,
    pub max_blocks: u64,
    pub device_id: u64,
    pub free_start: u64,
    pub free_end: u64,
    pub root: u64,
    pub blocks_in_free: u64,
}

impl Default for Layout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Layout {
    pub const DEFAULT: Self = Self {
        block_size: BLOCK_SIZE,
        max_blocks: MAX_NUM_BLOCKS,
        device_id: DEV_ID,
        free_start: FREE_START,
        free_end: FREE_END,
        root: ROOT,
        blocks_in_free: BLOCKS_IN_FREE,
    };

    /// Same layout with a different number of addressable blocks.
    #[must_use]
    pub const fn with_max_blocks(self, max_blocks: u64) -> Self {
        Self { max_blocks, ..self }
    }

    #[must_use]
    pub fn root_block(&self) -> BlockNumber {
        BlockNumber(self.root)
    }

    /// Largest payload a direct data block may hold.
    #[must_use]
    pub fn max_direct_payload(&self) -> usize {
        self.block_size.saturating_sub(1)
    }

    /// Free-list block numbers, `free_start..=free_end`.
    pub fn free_list_blocks(&self) -> impl Iterator<Item = BlockNumber> {
        (self.free_start..=self.free_end).map(BlockNumber)
    }

    /// Block numbers eligible for allocation: `root + 1 .. max_blocks`.
    #[must_use]
    pub fn data_range(&self) -> Range<u64> {
        self.root.saturating_add(1)..self.max_blocks
    }

    /// Free-list block that records `block` when it is free.
    ///
    /// Returns `None` when the slot would fall past `free_end`.
    #[must_use]
    pub fn free_list_slot(&self, block: BlockNumber) -> Option<BlockNumber> {
        if self.blocks_in_free == 0 {
            return None;
        }
        let slot = self.free_start.checked_add(block.0 / self.blocks_in_free)?;
        (slot <= self.free_end).then_some(BlockNumber(slot))
    }

    /// Validate a raw block number read from disk.
    pub fn check_block(&self, raw: u64) -> Result<BlockNumber, ParseError> {
        if raw >= self.max_blocks {
            return Err(ParseError::BlockOutOfRange {
                value: raw,
                max: self.max_blocks,
            });
        }
        Ok(BlockNumber(raw))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("shape mismatch: expected {expected}, found {open} '{{' and {close} '}}'")]
    Shape {
        expected: &'static str,
        open: usize,
        close: usize,
    },
    #[error("missing field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid integer for {field}: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
    #[error("block number {value} out of range (max_blocks {max})")]
    BlockOutOfRange { value: u64, max: u64 },
    #[error("invalid directory entry {entry:?} ({reason})")]
    InvalidEntry { entry: String, reason: &'static str },
    #[error("ambiguous location content ({reason})")]
    Ambiguous { reason: &'static str },
    #[error("encoded record is {len} bytes, block holds {max}")]
    Oversized { len: usize, max: usize },
}

/// Parse an unsigned integer token.
///
/// A token is an integer iff, after trimming ASCII whitespace, it is one or
/// more ASCII digits whose value fits in `u64`. Leading zeros are accepted;
/// signs are not.
#[must_use]
pub fn parse_uint(token: &str) -> Option<u64> {
    let token = token.trim_ascii();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// [`parse_uint`] with a field name attached to the error.
pub fn parse_field(field: &'static str, value: &str) -> Result<u64, ParseError> {
    parse_uint(value).ok_or_else(|| ParseError::InvalidInteger {
        field,
        value: value.trim_ascii().to_owned(),
    })
}
