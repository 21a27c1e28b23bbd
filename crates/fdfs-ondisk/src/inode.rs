use crate::text::{Fields, Shape, pad_record, record_text};
use fdfs_types::{BlockNumber, Layout, ParseError};
use serde::{Deserialize, Serialize};

/// File metadata plus a pointer to its data.
///
/// On disk:
/// `size:<n>,uid:<n>,gid:<n>,mode:<n>,linkcount:<n>,atime:<n>,ctime:<n>,mtime:<n>,{ indirect:<0|1> location:<n>}`
///
/// `indirect` is a hint only; the checker recomputes it from the content at
/// `location`, so any non-zero stored value decodes as `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInode {
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub mode: u64,
    pub linkcount: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub indirect: bool,
    pub location: BlockNumber,
}

impl FileInode {
    pub fn parse(raw: &[u8], layout: &Layout) -> Result<Self, ParseError> {
        let text = record_text(raw);
        Shape::detect(&text).expect("file inode", |s| s.open == 1 && s.close == 1)?;

        let body = text.replace(['{', '}'], " ");
        let fields = Fields::parse(&body);

        Ok(Self {
            size: fields.require("size")?,
            uid: fields.require("uid")?,
            gid: fields.require("gid")?,
            mode: fields.require("mode")?,
            linkcount: fields.require("linkcount")?,
            atime: fields.require("atime")?,
            ctime: fields.require("ctime")?,
            mtime: fields.require("mtime")?,
            indirect: fields.require("indirect")? != 0,
            location: layout.check_block(fields.require("location")?)?,
        })
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        let text = format!(
            "size:{},uid:{},gid:{},mode:{},linkcount:{},atime:{},ctime:{},mtime:{},{{ indirect:{} location:{}}}",
            self.size,
            self.uid,
            self.gid,
            self.mode,
            self.linkcount,
            self.atime,
            self.ctime,
            self.mtime,
            u8::from(self.indirect),
            self.location,
        );
        pad_record(&text, block_size)
    }
}
