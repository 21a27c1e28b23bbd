use crate::text::{Fields, Shape, pad_record, record_text};
use fdfs_types::{BlockNumber, Layout, ParseError, parse_uint};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SELF_NAME: &str = ".";
pub const PARENT_NAME: &str = "..";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

impl EntryKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "d" => Some(Self::Directory),
            "f" => Some(Self::File),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Directory => 'd',
            Self::File => 'f',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub name: String,
    pub block: BlockNumber,
}

impl DirEntry {
    #[must_use]
    pub fn new(kind: EntryKind, name: impl Into<String>, block: BlockNumber) -> Self {
        Self {
            kind,
            name: name.into(),
            block,
        }
    }

    #[must_use]
    pub fn is_self(&self) -> bool {
        self.name == SELF_NAME
    }

    #[must_use]
    pub fn is_parent(&self) -> bool {
        self.name == PARENT_NAME
    }

    /// `.` or `..`.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.is_self() || self.is_parent()
    }

    /// Parse `<kind>:<name>:<block>`.
    ///
    /// The name is everything between the first and the last colon, so names
    /// may themselves contain colons.
    fn parse(raw: &str, layout: &Layout) -> Result<Self, ParseError> {
        let invalid = |reason| ParseError::InvalidEntry {
            entry: raw.to_owned(),
            reason,
        };
        let (tag, rest) = raw.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        let (name, block) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing block number"))?;
        let kind = EntryKind::from_tag(tag.trim()).ok_or_else(|| invalid("unknown kind"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        let block = parse_uint(block).ok_or_else(|| invalid("block is not an integer"))?;
        Ok(Self {
            kind,
            name: name.to_owned(),
            block: layout.check_block(block)?,
        })
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.tag(), self.name, self.block)
    }
}

/// Directory metadata plus its ordered entries.
///
/// On disk:
/// `{size:<n>,uid:<n>,gid:<n>,mode:<n>,atime:<n>,ctime:<n>,mtime:<n>,linkcount:<n>{<k>:<name>:<b>, ...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub mode: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub linkcount: u64,
    pub entries: Vec<DirEntry>,
}

impl DirectoryRecord {
    pub fn parse(raw: &[u8], layout: &Layout) -> Result<Self, ParseError> {
        let text = record_text(raw);
        Shape::detect(&text).expect("directory", |s| s.open == 2 && s.close == 2)?;

        // Exactly two of each brace: `{ header { entries } }`.
        let mut opens = text.match_indices('{').map(|(i, _)| i);
        let mut closes = text.match_indices('}').map(|(i, _)| i);
        let (Some(outer), Some(inner), Some(inner_end)) = (opens.next(), opens.next(), closes.next())
        else {
            return Err(ParseError::MissingField { field: "entries" });
        };
        if inner_end < inner {
            return Err(ParseError::Shape {
                expected: "directory",
                open: 2,
                close: 2,
            });
        }

        let fields = Fields::parse(&text[outer + 1..inner]);
        let entries = text[inner + 1..inner_end]
            .split(',')
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .map(|piece| DirEntry::parse(piece, layout))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            size: fields.require("size")?,
            uid: fields.require("uid")?,
            gid: fields.require("gid")?,
            mode: fields.require("mode")?,
            atime: fields.require("atime")?,
            ctime: fields.require("ctime")?,
            mtime: fields.require("mtime")?,
            linkcount: fields.require("linkcount")?,
            entries,
        })
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let entries = self
            .entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!(
            "{{size:{},uid:{},gid:{},mode:{},atime:{},ctime:{},mtime:{},linkcount:{}{{{entries}}}}}",
            self.size,
            self.uid,
            self.gid,
            self.mode,
            self.atime,
            self.ctime,
            self.mtime,
            self.linkcount,
        );
        pad_record(&text, block_size)
    }
}
