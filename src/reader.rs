//! Block enumeration — serial magic scan and index-assisted reads.
//!
//! # Serial path
//! [`read_blocks_serially`] walks forward from the cursor in 4-byte steps.
//! NUL bytes are tolerated before the first block only; the scan stops at
//! the block-index marker or after a streamed block (terminal by
//! definition).  Up to 3 trailing zero bytes after the last block are
//! tolerated with a warning; any non-zero trailing byte is an error.
//!
//! # Indexed path
//! [`read_blocks`] searches backward from end of file for the block index.
//! When the index parses and its first and last offsets begin with block
//! magic, every other block becomes a *lazy placeholder* that knows only
//! its offset; forcing a placeholder's header or payload triggers a normal
//! header read at that offset.  Any defect in the index logs a warning and
//! falls back to the serial scan — the index is advisory, the blocks are
//! authoritative.

use std::cell::RefCell;
use std::io::SeekFrom;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::block::{self, BlockData, BlockHeader, BLOCK_MAGIC};
use crate::compression::CodecRegistry;
use crate::error::{AsdfError, Result};
use crate::generic_io::{GenericFile, SharedFile};
use crate::index;

// ── ReadBlock ────────────────────────────────────────────────────────────────

/// One block read (or promised) from a file.
///
/// `offset` addresses the byte after the block magic, i.e. the 2-byte
/// header-size field.  The payload lives behind the union of states
/// described in the module docs: already loaded, memory-mapped, or deferred
/// behind a weak file handle that fails with `FileClosed` once the file is
/// gone.
pub struct ReadBlock {
    pub offset: u64,
    fd: Weak<RefCell<GenericFile>>,
    memmap: bool,
    lazy: bool,
    validate_checksum: bool,
    /// Codec snapshot captured when the owning file was created.
    registry: CodecRegistry,
    pub header: Option<BlockHeader>,
    pub data_offset: Option<u64>,
    data: Option<BlockData>,
    /// Decompressed payload, materialized at most once.  The `Rc` identity
    /// of this buffer is what ties tree arrays back to their source block.
    cached: Option<Rc<Vec<u8>>>,
}

impl ReadBlock {
    #[allow(clippy::too_many_arguments)]
    fn new(
        offset: u64,
        fd: &SharedFile,
        memmap: bool,
        lazy: bool,
        validate_checksum: bool,
        registry: &CodecRegistry,
        header: Option<BlockHeader>,
        data_offset: Option<u64>,
        data: Option<BlockData>,
    ) -> Self {
        Self {
            offset,
            fd: Rc::downgrade(fd),
            memmap,
            lazy,
            validate_checksum,
            registry: registry.clone(),
            header,
            data_offset,
            data,
            cached: None,
        }
    }

    /// Placeholder knowing only its offset (the indexed path).
    fn placeholder(
        offset: u64,
        fd: &SharedFile,
        memmap: bool,
        validate_checksum: bool,
        registry: &CodecRegistry,
    ) -> Self {
        Self::new(
            offset,
            fd,
            memmap,
            true,
            validate_checksum,
            registry,
            None,
            None,
            None,
        )
    }

    /// True once the payload itself is in memory (or mapped).
    pub fn loaded(&self) -> bool {
        self.cached.is_some() || self.data.is_some()
    }

    fn upgrade_fd(&self) -> Result<SharedFile> {
        match self.fd.upgrade() {
            Some(fd) if !fd.borrow().is_closed() => Ok(fd),
            _ => Err(AsdfError::FileClosed),
        }
    }

    /// Force the header (and, for non-lazy blocks, the payload) of a
    /// placeholder.
    pub fn ensure_header(&mut self) -> Result<&BlockHeader> {
        if self.header.is_none() {
            let fd = self.upgrade_fd()?;
            let mut fd = fd.borrow_mut();
            let (_, header, data_offset, data) = block::read_block(
                &mut fd,
                Some(self.offset),
                self.memmap,
                self.lazy,
                &self.registry,
            )?;
            self.header = Some(header);
            self.data_offset = Some(data_offset);
            self.data = data;
        }
        Ok(self.header.as_ref().expect("header just read"))
    }

    /// The decompressed payload, loading it on first access.
    pub fn data(&mut self) -> Result<Rc<Vec<u8>>> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }
        self.ensure_header()?;
        if self.data.is_none() {
            let fd = self.upgrade_fd()?;
            let mut fd = fd.borrow_mut();
            let header = self.header.as_ref().expect("header forced above");
            let data_offset = self.data_offset.expect("data offset forced above");
            let data = block::read_block_data(
                &mut fd,
                header,
                Some(data_offset),
                self.memmap,
                &self.registry,
            )?;
            self.data = Some(data);
        }
        let bytes = self.data.as_ref().expect("payload just read").to_vec()?;
        let header = self.header.as_ref().expect("header forced above");
        if self.validate_checksum && !header.is_streamed() {
            block::validate_checksum(header, &bytes)?;
        }
        let rc = Rc::new(bytes);
        self.cached = Some(rc.clone());
        Ok(rc)
    }

    /// The cached payload, if any, without touching the file.
    pub fn cached_data(&self) -> Option<Rc<Vec<u8>>> {
        self.cached.clone()
    }
}

impl std::fmt::Debug for ReadBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBlock")
            .field("offset", &self.offset)
            .field("loaded", &self.loaded())
            .field("header", &self.header)
            .finish()
    }
}

// ── Serial scan ──────────────────────────────────────────────────────────────

/// Scan forward from the cursor, reading every block until the index
/// marker, a streamed block, or end of file.
pub fn read_blocks_serially(
    fd: &SharedFile,
    memmap: bool,
    lazy: bool,
    validate_checksum: bool,
    registry: &CodecRegistry,
) -> Result<Vec<ReadBlock>> {
    let mut blocks: Vec<ReadBlock> = Vec::new();
    let mut buff: Vec<u8> = Vec::new();
    loop {
        {
            let mut f = fd.borrow_mut();
            let chunk = f.read(4 - buff.len())?;
            buff.extend_from_slice(&chunk);
        }
        if buff.len() < 4 {
            // End of stream mid-step.  A few zero bytes of slack are
            // tolerated; anything else between blocks is corruption.
            if buff.iter().any(|&b| b != 0) {
                return Err(AsdfError::TrailingGarbage(buff));
            }
            if !buff.is_empty() {
                warn!(count = buff.len(), "trailing zero bytes after final block");
            }
            break;
        }

        if buff == index::INDEX_HEADER[..4] {
            break;
        }

        if buff == BLOCK_MAGIC {
            let (offset, header, data_offset, data) = {
                let mut f = fd.borrow_mut();
                block::read_block(&mut f, None, memmap, lazy, registry)?
            };
            let streamed = header.is_streamed();
            let mut blk = ReadBlock::new(
                offset,
                fd,
                memmap,
                lazy,
                validate_checksum,
                registry,
                Some(header),
                Some(data_offset),
                data,
            );
            if !lazy && validate_checksum {
                blk.data()?;
            }
            blocks.push(blk);
            if streamed {
                // A file has at most one streamed block and it is last.
                break;
            }
            buff.clear();
        } else {
            if !blocks.is_empty() || buff[0] != 0 {
                let offset = fd.borrow_mut().tell().unwrap_or(0);
                return Err(AsdfError::BadMagic {
                    offset: offset.saturating_sub(buff.len() as u64),
                    found: hex::encode(&buff),
                });
            }
            // Leading NUL padding before the first block.
            while buff.first() == Some(&0) {
                buff.remove(0);
            }
            while buff.last() == Some(&0) {
                buff.pop();
            }
        }
    }
    Ok(blocks)
}

// ── Indexed scan with fallback ───────────────────────────────────────────────

/// Enumerate the blocks of `fd`, using the end-of-file index when the file
/// is seekable and lazy loading is wanted, and falling back to the serial
/// scan otherwise (or whenever the index is unusable).
pub fn read_blocks(
    fd: &SharedFile,
    memmap: bool,
    lazy: bool,
    validate_checksum: bool,
    registry: &CodecRegistry,
) -> Result<Vec<ReadBlock>> {
    let seekable = fd.borrow().seekable();
    if !lazy || !seekable {
        return read_blocks_serially(fd, memmap, lazy, validate_checksum, registry);
    }

    let starting_offset = fd.borrow_mut().tell()?;
    let index_offset = {
        let mut f = fd.borrow_mut();
        index::find_block_index(&mut f, Some(starting_offset), None)?
    };
    let Some(index_offset) = index_offset else {
        fd.borrow_mut().seek(SeekFrom::Start(starting_offset))?;
        return read_blocks_serially(fd, memmap, lazy, validate_checksum, registry);
    };

    let offsets = {
        let mut f = fd.borrow_mut();
        index::read_block_index(&mut f, Some(index_offset))
    };
    let offsets = match offsets {
        Ok(offsets) if !offsets.is_empty() => offsets,
        Ok(_) => {
            warn!("empty block index, falling back to serial block reading");
            fd.borrow_mut().seek(SeekFrom::Start(starting_offset))?;
            return read_blocks_serially(fd, memmap, lazy, validate_checksum, registry);
        }
        Err(e) => {
            warn!(error = %e, "failed to read block index, falling back to serial block reading");
            fd.borrow_mut().seek(SeekFrom::Start(starting_offset))?;
            return read_blocks_serially(fd, memmap, lazy, validate_checksum, registry);
        }
    };

    // Placeholders know only their offset (past the magic).
    let mut blocks: Vec<ReadBlock> = offsets
        .iter()
        .map(|&o| ReadBlock::placeholder(o + 4, fd, memmap, validate_checksum, registry))
        .collect();

    // Cheap validity test: the first and last offsets must begin with block
    // magic, and their headers must parse.
    let check = |blocks: &mut Vec<ReadBlock>| -> Result<()> {
        for index in [0, blocks.len() - 1] {
            let magic = {
                let mut f = fd.borrow_mut();
                f.seek(SeekFrom::Start(offsets[index]))?;
                f.read(4)?
            };
            if magic != BLOCK_MAGIC {
                return Err(AsdfError::InvalidBlockIndex(format!(
                    "offset {} does not point at block magic",
                    offsets[index]
                )));
            }
            blocks[index].ensure_header()?;
        }
        Ok(())
    };
    if let Err(e) = check(&mut blocks) {
        warn!(error = %e, "invalid block index, falling back to serial block reading");
        fd.borrow_mut().seek(SeekFrom::Start(starting_offset))?;
        return read_blocks_serially(fd, memmap, lazy, validate_checksum, registry);
    }
    Ok(blocks)
}
