//! Device-id gate and superblock field repair.

use crate::report::Findings;
use crate::store_record;
use fdfs_block::{BlockBuf, BlockStore};
use fdfs_error::{FsckError, Result};
use fdfs_ondisk::{Superblock, SuperblockFields};
use fdfs_types::{BlockNumber, Layout, ParseError};
use tracing::error;

pub struct SuperblockValidator<'a> {
    store: &'a dyn BlockStore,
    layout: Layout,
}

impl<'a> SuperblockValidator<'a> {
    pub fn new(store: &'a dyn BlockStore, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Read the superblock without changing anything.
    ///
    /// Every field must decode.
    pub fn read(&self) -> Result<Superblock> {
        let (_, fields) = self.load()?;
        fields
            .complete()
            .map_err(|err| FsckError::Superblock(err.to_string()))
    }

    fn load(&self) -> Result<(BlockBuf, SuperblockFields)> {
        let raw = self.store.read_block(BlockNumber::SUPERBLOCK)?;
        let fields = SuperblockFields::parse(raw.as_slice())
            .map_err(|err| FsckError::Superblock(err.to_string()))?;
        Ok((raw, fields))
    }

    /// Check the device id, then repair the remaining fields.
    ///
    /// A foreign device id, or a block 0 whose shape or device id cannot be
    /// decoded, stops here with nothing written. Otherwise `creationTime` is
    /// clamped to `now` (or set to it when undecodable), the layout fields
    /// are reset to the expected geometry, and the record is written back
    /// whole.
    pub fn validate_and_repair(&self, now: u64, findings: &mut Findings) -> Result<Superblock> {
        let (raw, fields) = self.load().inspect_err(|err| {
            error!(target: "fdfs::superblock", error = %err, "superblock_unreadable");
        })?;

        if fields.device_id != self.layout.device_id {
            error!(
                target: "fdfs::superblock",
                expected = self.layout.device_id,
                found = fields.device_id,
                "device_id_mismatch"
            );
            return Err(FsckError::DeviceMismatch {
                expected: self.layout.device_id,
                found: fields.device_id,
            });
        }

        let block = BlockNumber::SUPERBLOCK;
        let creation_time = match fields.creation_time {
            Ok(time) if time > now => {
                findings.repaired(
                    block,
                    format!("creationTime {time} is in the future, now {now}"),
                );
                now
            }
            Ok(time) => time,
            Err(err) => {
                findings.repaired(block, format!("creationTime set to {now}: {err}"));
                now
            }
        };

        let mut layout_field =
            |field: &str, decoded: std::result::Result<u64, ParseError>, want: u64| {
                match decoded {
                    Ok(value) if value == want => {}
                    Ok(value) => findings.repaired(block, format!("{field} {value} -> {want}")),
                    Err(err) => findings.repaired(block, format!("{field} set to {want}: {err}")),
                }
                want
            };
        let sb = Superblock {
            creation_time,
            reserved: fields.reserved,
            device_id: fields.device_id,
            free_start: layout_field("freeStart", fields.free_start, self.layout.free_start),
            free_end: layout_field("freeEnd", fields.free_end, self.layout.free_end),
            root: layout_field("root", fields.root, self.layout.root),
            max_blocks: layout_field("maxBlocks", fields.max_blocks, self.layout.max_blocks),
            braced: fields.braced,
        };

        store_record(
            self.store,
            findings,
            block,
            "superblock",
            raw.as_slice(),
            sb.encode(self.layout.block_size),
        )?;
        Ok(sb)
    }
}
