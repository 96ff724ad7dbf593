//! Block emission — an ordered run of blocks plus the optional index.

use std::rc::Rc;

use crate::block::{self, BlockHeader, BlockWriteOptions};
use crate::compression::CodecRegistry;
use crate::error::Result;
use crate::generic_io::GenericFile;
use crate::index;
use crate::manager::DataCallback;

// ── WriteBlock ───────────────────────────────────────────────────────────────

/// Where a pending block's bytes come from.
#[derive(Clone)]
pub enum BlockSource {
    /// An in-memory buffer owned by the tree.
    Buffer(Rc<Vec<u8>>),
    /// A lazy pull from a block of the file being read.
    Callback(Rc<DataCallback>),
}

/// A block waiting to be written.
#[derive(Clone)]
pub struct WriteBlock {
    pub source: BlockSource,
    pub compression: Option<String>,
    /// Codec level; negative selects the codec default.
    pub level: i32,
    /// Relative URI, set only for external blocks.
    pub uri: Option<String>,
}

impl WriteBlock {
    pub fn new(source: BlockSource, compression: Option<String>, level: i32) -> Self {
        Self {
            source,
            compression,
            level,
            uri: None,
        }
    }

    /// Materialize the payload bytes.
    pub fn data(&self) -> Result<Rc<Vec<u8>>> {
        match &self.source {
            BlockSource::Buffer(buf) => Ok(buf.clone()),
            BlockSource::Callback(cb) => cb.call(),
        }
    }
}

// ── write_blocks ─────────────────────────────────────────────────────────────

/// Emit `blocks` in order, then the streamed block (if any), then the block
/// index (when at least one block was written, `write_index` is set, and
/// the file is seekable).  Codec labels resolve against `registry`, the
/// writing file's captured snapshot.  Returns the magic offsets and
/// headers written.
pub fn write_blocks(
    fd: &mut GenericFile,
    blocks: &[WriteBlock],
    padding: f64,
    streamed_block: Option<&WriteBlock>,
    write_index: bool,
    registry: &CodecRegistry,
) -> Result<(Vec<u64>, Vec<BlockHeader>)> {
    let mut offsets = Vec::with_capacity(blocks.len() + 1);
    let mut headers = Vec::with_capacity(blocks.len() + 1);
    for blk in blocks {
        offsets.push(fd.tell()?);
        let data = blk.data()?;
        let opts = BlockWriteOptions {
            compression: blk.compression.clone(),
            level: blk.level,
            padding,
            ..Default::default()
        };
        headers.push(block::write_block(fd, &data, &opts, registry)?);
    }
    if let Some(streamed) = streamed_block {
        offsets.push(fd.tell()?);
        let data = streamed.data()?;
        let opts = BlockWriteOptions {
            stream: true,
            ..Default::default()
        };
        headers.push(block::write_block(fd, &data, &opts, registry)?);
    } else if !blocks.is_empty() && write_index && fd.seekable() {
        index::write_block_index(fd, &offsets, None)?;
    }
    Ok((offsets, headers))
}
