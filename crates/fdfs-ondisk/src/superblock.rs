use crate::text::{Fields, Shape, pad_record, record_text};
use fdfs_types::{Layout, ParseError};
use serde::{Deserialize, Serialize};

/// Keys the superblock names; anything else in the second slot is reserved.
const NAMED_KEYS: [&str; 7] = [
    "creationTime",
    "deviceId",
    "devId",
    "freeStart",
    "freeEnd",
    "root",
    "maxBlocks",
];

/// Filesystem-wide configuration stored in block 0.
///
/// On disk:
/// `{creationTime:<n>,<reserved>,deviceId:<n>,freeStart:<n>,freeEnd:<n>,root:<n>,maxBlocks:<n>}`
/// where the opening brace is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub creation_time: u64,
    /// Second comma-separated field, kept verbatim and never validated.
    /// Empty when the record has no reserved slot.
    pub reserved: String,
    pub device_id: u64,
    pub free_start: u64,
    pub free_end: u64,
    pub root: u64,
    pub max_blocks: u64,
    /// Whether the record opens with `{`; encoding keeps the form it was
    /// read in.
    #[serde(skip, default = "opens_with_brace")]
    pub braced: bool,
}

fn opens_with_brace() -> bool {
    true
}

/// Block 0 decoded with only its shape and device id required.
///
/// Every other field carries its own decode result so a damaged field can be
/// repaired without giving up on the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperblockFields {
    pub device_id: u64,
    pub reserved: String,
    pub braced: bool,
    pub creation_time: Result<u64, ParseError>,
    pub free_start: Result<u64, ParseError>,
    pub free_end: Result<u64, ParseError>,
    pub root: Result<u64, ParseError>,
    pub max_blocks: Result<u64, ParseError>,
}

impl SuperblockFields {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let text = record_text(raw);
        Shape::detect(&text).expect("superblock", |s| s.close == 1 && s.open <= 1)?;

        let braced = text.trim_start().starts_with('{');
        let body = text
            .trim_start()
            .trim_start_matches('{')
            .trim_end()
            .trim_end_matches('}');
        let fields = Fields::parse(body);

        Ok(Self {
            device_id: fields.require_any("deviceId", &["devId"])?,
            reserved: reserved_slot(body),
            braced,
            creation_time: fields.require("creationTime"),
            free_start: fields.require("freeStart"),
            free_end: fields.require("freeEnd"),
            root: fields.require("root"),
            max_blocks: fields.require("maxBlocks"),
        })
    }

    /// Every field decoded, or the first one that was not.
    pub fn complete(self) -> Result<Superblock, ParseError> {
        Ok(Superblock {
            creation_time: self.creation_time?,
            reserved: self.reserved,
            device_id: self.device_id,
            free_start: self.free_start?,
            free_end: self.free_end?,
            root: self.root?,
            max_blocks: self.max_blocks?,
            braced: self.braced,
        })
    }
}

/// The second comma-separated piece, unless it is one of the named fields.
fn reserved_slot(body: &str) -> String {
    let Some(piece) = body.split(',').nth(1).map(str::trim) else {
        return String::new();
    };
    let key = piece.split_once(':').map_or(piece, |(key, _)| key).trim();
    if NAMED_KEYS.contains(&key) {
        String::new()
    } else {
        piece.to_owned()
    }
}

impl Superblock {
    /// Superblock describing `layout`, created at `creation_time`.
    #[must_use]
    pub fn for_layout(layout: &Layout, creation_time: u64) -> Self {
        Self {
            creation_time,
            reserved: "mounted:0".to_owned(),
            device_id: layout.device_id,
            free_start: layout.free_start,
            free_end: layout.free_end,
            root: layout.root,
            max_blocks: layout.max_blocks,
            braced: true,
        }
    }

    /// Decode block 0, requiring every field.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        SuperblockFields::parse(raw)?.complete()
    }

    /// Encode as padded block content.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let open = if self.braced { "{" } else { "" };
        let reserved = if self.reserved.is_empty() {
            String::new()
        } else {
            format!("{},", self.reserved)
        };
        let text = format!(
            "{open}creationTime:{},{reserved}deviceId:{},freeStart:{},freeEnd:{},root:{},maxBlocks:{}}}",
            self.creation_time,
            self.device_id,
            self.free_start,
            self.free_end,
            self.root,
            self.max_blocks,
        );
        pad_record(&text, block_size)
    }
}
