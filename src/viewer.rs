//! Read-only block handles for diagnostics and the `info` command.

use std::cell::RefCell;
use std::rc::Rc;

use crate::block::BlockHeader;
use crate::error::Result;
use crate::reader::ReadBlock;

/// A read-only window onto one block of an open file.
pub struct BlockView {
    blocks: Rc<RefCell<Vec<ReadBlock>>>,
    index: usize,
}

impl BlockView {
    pub(crate) fn new(blocks: Rc<RefCell<Vec<ReadBlock>>>, index: usize) -> Self {
        Self { blocks, index }
    }

    /// The block header, forcing a header read for lazy placeholders.
    pub fn header(&self) -> Result<BlockHeader> {
        let mut blocks = self.blocks.borrow_mut();
        Ok(blocks[self.index].ensure_header()?.clone())
    }

    /// Offset of the header (just past the block magic).
    pub fn offset(&self) -> u64 {
        self.blocks.borrow()[self.index].offset
    }

    pub fn data_offset(&self) -> Option<u64> {
        self.blocks.borrow()[self.index].data_offset
    }

    /// Whether the payload is in memory already.
    pub fn loaded(&self) -> bool {
        self.blocks.borrow()[self.index].loaded()
    }

    /// Load (if necessary) and return the payload.
    pub fn load(&self) -> Result<Rc<Vec<u8>>> {
        self.blocks.borrow_mut()[self.index].data()
    }

    /// One human-readable summary line.
    pub fn info(&self) -> Result<String> {
        let header = self.header()?;
        if header.is_streamed() {
            return Ok("Stream".to_string());
        }
        let mut line = format!("{} bytes", header.allocated_size);
        if header.allocated_size != header.used_size {
            line.push_str(&format!(", {} used", header.used_size));
        }
        if let Some(label) = &header.compression {
            line.push_str(&format!(", {label} compression"));
        }
        Ok(line)
    }
}

/// Indexable collection of [`BlockView`]s for one open file.
pub struct BlockViewer {
    blocks: Rc<RefCell<Vec<ReadBlock>>>,
}

impl BlockViewer {
    pub(crate) fn new(blocks: Rc<RefCell<Vec<ReadBlock>>>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<BlockView> {
        if index < self.len() {
            Some(BlockView::new(self.blocks.clone(), index))
        } else {
            None
        }
    }

    /// Summary lines, one per block.
    pub fn info_lines(&self) -> Result<Vec<String>> {
        let n = self.len();
        let width = n.max(1).to_string().len();
        let mut lines = Vec::with_capacity(n);
        for i in 0..n {
            let view = BlockView::new(self.blocks.clone(), i);
            lines.push(format!("Block {i:>width$}: {}", view.info()?));
        }
        Ok(lines)
    }
}
