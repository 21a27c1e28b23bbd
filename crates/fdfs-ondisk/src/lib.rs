#![forbid(unsafe_code)]
//! On-disk format parsing for fusedata records.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes the printable-text
//! content of a block into typed records (superblock, directory, file inode,
//! block lists) and encodes repaired records back to block content.
//!
//! Every decoder checks the record's brace counts before interpreting any
//! field, so asking for the wrong kind of record yields
//! [`ParseError::Shape`](fdfs_types::ParseError::Shape) rather than a
//! misread.

pub mod dir;
pub mod inode;
pub mod list;
pub mod superblock;
mod text;

pub use dir::{DirEntry, DirectoryRecord, EntryKind};
pub use inode::FileInode;
pub use list::{LocationContent, classify_location, encode_block_list, parse_block_list};
pub use superblock::{Superblock, SuperblockFields};
pub use text::{Shape, pad_record};
