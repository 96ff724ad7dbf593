//! Block manager — binds logical arrays to blocks.
//!
//! The manager owns three kinds of state:
//!
//! - the ordered list of blocks read from the file, with stable indices;
//! - per-array options (`storage type` + compression), keyed by the
//!   identity of the underlying byte buffer;
//! - pending write state: internal blocks in write order (deduplicated by
//!   buffer identity), external blocks with synthesized sibling URIs, and
//!   at most one streamed block.
//!
//! Buffer identity is the identity of the base byte buffer, never of any
//! array wrapper around it: arrays holding the same `Rc` buffer share one
//! block, and an array whose bytes came from read block `i` is identified
//! as block `i` until those bytes are detached.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use crate::block::FLAG_STREAMED;
use crate::config::{AsdfConfig, OutputCompression};
use crate::error::{AsdfError, Result};
use crate::generic_io::uri_stem;
use crate::reader::ReadBlock;
use crate::writer::{BlockSource, WriteBlock};

// ── Storage classes ──────────────────────────────────────────────────────────

/// Where a logical array's bytes live in the written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// A block in the block section of the main file.
    Internal,
    /// A sibling single-block file, referenced by relative URI.
    External,
    /// Literal nested sequences in the YAML tree.
    Inline,
    /// The terminal unbounded block.
    Streamed,
}

impl StorageType {
    pub fn name(self) -> &'static str {
        match self {
            StorageType::Internal => "internal",
            StorageType::External => "external",
            StorageType::Inline => "inline",
            StorageType::Streamed => "streamed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "internal" => Some(StorageType::Internal),
            "external" => Some(StorageType::External),
            "inline" => Some(StorageType::Inline),
            "streamed" => Some(StorageType::Streamed),
            _ => None,
        }
    }
}

/// Per-array write options.
#[derive(Debug, Clone)]
pub struct BlockOptions {
    pub storage: StorageType,
    pub compression: Option<String>,
    /// Codec level; negative selects the codec default.
    pub level: i32,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            storage: StorageType::Internal,
            compression: None,
            level: -1,
        }
    }
}

// ── Buffer identity ──────────────────────────────────────────────────────────

/// Identity of an array's base byte buffer.
#[derive(Clone)]
pub enum BufferKey {
    /// An in-memory buffer; identity is the `Rc` allocation.
    Memory(Rc<Vec<u8>>),
    /// Bytes still living in read block `i` of the main file.
    Block(usize),
}

impl BufferKey {
    pub fn matches(&self, other: &BufferKey) -> bool {
        match (self, other) {
            (BufferKey::Memory(a), BufferKey::Memory(b)) => Rc::ptr_eq(a, b),
            (BufferKey::Block(a), BufferKey::Block(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferKey::Memory(rc) => write!(f, "Memory({:p})", Rc::as_ptr(rc)),
            BufferKey::Block(i) => write!(f, "Block({i})"),
        }
    }
}

// ── Data callbacks ───────────────────────────────────────────────────────────

/// Lazy pull of a read block's payload, handed to tree arrays so internal
/// data that was never loaded can be re-materialized at serialize time.
/// The index is interior-mutable so the update engine can re-point arrays
/// at their post-update block positions.
pub struct DataCallback {
    index: Cell<usize>,
    blocks: RefCell<Weak<RefCell<Vec<ReadBlock>>>>,
}

impl DataCallback {
    pub fn new(index: usize, blocks: &Rc<RefCell<Vec<ReadBlock>>>) -> Self {
        Self {
            index: Cell::new(index),
            blocks: RefCell::new(Rc::downgrade(blocks)),
        }
    }

    pub fn index(&self) -> usize {
        self.index.get()
    }

    pub fn call(&self) -> Result<Rc<Vec<u8>>> {
        let blocks = self
            .blocks
            .borrow()
            .upgrade()
            .ok_or(AsdfError::FileClosed)?;
        let mut blocks = blocks.borrow_mut();
        blocks[self.index.get()].data()
    }

    /// Re-point at block `index` of (possibly different) `blocks`.
    pub fn reassign(&self, index: usize, blocks: &Rc<RefCell<Vec<ReadBlock>>>) {
        self.index.set(index);
        *self.blocks.borrow_mut() = Rc::downgrade(blocks);
    }
}

impl std::fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataCallback({})", self.index.get())
    }
}

// ── Write targets ────────────────────────────────────────────────────────────

/// What the YAML encoder should emit for an array's `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    /// Index into the internal block section.
    Index(usize),
    /// Relative URI of an external sibling file.
    ExternalUri(String),
    /// Sentinel: emit the array literally in the tree.
    Inline,
    /// The terminal streamed block.
    Streamed,
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct Manager {
    /// Blocks read from the file, shared with every outstanding callback.
    pub blocks: Rc<RefCell<Vec<ReadBlock>>>,
    /// `(buffer, options)` pairs; linear scan, files hold few arrays.
    options: Vec<(BufferKey, BlockOptions)>,
    pub write_blocks: Vec<WriteBlock>,
    write_keys: Vec<BufferKey>,
    pub external_write_blocks: Vec<WriteBlock>,
    external_keys: Vec<BufferKey>,
    pub streamed_block: Option<WriteBlock>,
    streamed_key: Option<BufferKey>,
    uri: Option<String>,
}

impl Manager {
    pub fn new(read_blocks: Vec<ReadBlock>, uri: Option<String>) -> Self {
        Self {
            blocks: Rc::new(RefCell::new(read_blocks)),
            options: Vec::new(),
            write_blocks: Vec::new(),
            write_keys: Vec::new(),
            external_write_blocks: Vec::new(),
            external_keys: Vec::new(),
            streamed_block: None,
            streamed_key: None,
            uri,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn set_uri(&mut self, uri: Option<String>) {
        self.uri = uri;
    }

    /// Drop all pending write state (after a write or a failed one).
    pub fn clear_write_state(&mut self) {
        self.write_blocks.clear();
        self.write_keys.clear();
        self.external_write_blocks.clear();
        self.external_keys.clear();
        self.streamed_block = None;
        self.streamed_key = None;
    }

    // ── Options ──────────────────────────────────────────────────────────────

    /// Options for a buffer.  When no record exists but the buffer is (or
    /// caches) a read block's payload, a record is synthesized from that
    /// block's header: storage `streamed` when the STREAMED flag is set,
    /// `internal` otherwise, compression from the header label.
    pub fn get_options(&mut self, key: &BufferKey) -> BlockOptions {
        if let Some((_, options)) = self.options.iter().find(|(k, _)| k.matches(key)) {
            return options.clone();
        }
        let synthesized = self.options_from_block(key);
        let options = synthesized.unwrap_or_default();
        self.options.push((key.clone(), options.clone()));
        options
    }

    fn options_from_block(&self, key: &BufferKey) -> Option<BlockOptions> {
        let mut blocks = self.blocks.borrow_mut();
        let block = match key {
            BufferKey::Block(index) => blocks.get_mut(*index)?,
            BufferKey::Memory(rc) => blocks.iter_mut().find(|blk| {
                blk.cached_data()
                    .map(|cached| Rc::ptr_eq(&cached, rc))
                    .unwrap_or(false)
            })?,
        };
        // Lazy placeholders know only their offset; the header decides the
        // synthesized options, so force it.
        let header = block.ensure_header().ok()?.clone();
        let storage = if header.flags & FLAG_STREAMED != 0 {
            StorageType::Streamed
        } else {
            StorageType::Internal
        };
        Some(BlockOptions {
            storage,
            compression: header.compression,
            level: -1,
        })
    }

    /// Install options for a buffer.  At most one buffer may be marked
    /// `streamed`.
    pub fn set_options(&mut self, key: BufferKey, options: BlockOptions) -> Result<()> {
        if options.storage == StorageType::Streamed {
            let other_streamed = self
                .options
                .iter()
                .any(|(k, o)| o.storage == StorageType::Streamed && !k.matches(&key));
            if other_streamed {
                return Err(AsdfError::DuplicateStream);
            }
        }
        if let Some(entry) = self.options.iter_mut().find(|(k, _)| k.matches(&key)) {
            entry.1 = options;
        } else {
            self.options.push((key, options));
        }
        Ok(())
    }

    // ── Write side ───────────────────────────────────────────────────────────

    /// Allocate (or find) a slot for an array's bytes and return what the
    /// YAML encoder should emit as its `source`.
    pub fn make_write_block(
        &mut self,
        key: &BufferKey,
        source: BlockSource,
        options: &BlockOptions,
    ) -> Result<WriteTarget> {
        match options.storage {
            StorageType::Inline => Ok(WriteTarget::Inline),
            StorageType::Streamed => {
                self.set_streamed_block(key.clone(), source)?;
                Ok(WriteTarget::Streamed)
            }
            StorageType::External => {
                if let Some(pos) = self.external_keys.iter().position(|k| k.matches(key)) {
                    let uri = self.external_write_blocks[pos]
                        .uri
                        .clone()
                        .expect("external block always carries a uri");
                    return Ok(WriteTarget::ExternalUri(uri));
                }
                let base = self.uri.clone().unwrap_or_default();
                let index = self.external_write_blocks.len();
                let uri = format!("{}{index:04}.asdf", uri_stem(&base));
                let mut blk =
                    WriteBlock::new(source, options.compression.clone(), options.level);
                blk.uri = Some(uri.clone());
                self.external_write_blocks.push(blk);
                self.external_keys.push(key.clone());
                Ok(WriteTarget::ExternalUri(uri))
            }
            StorageType::Internal => {
                if let Some(pos) = self.write_keys.iter().position(|k| k.matches(key)) {
                    return Ok(WriteTarget::Index(pos));
                }
                self.write_blocks.push(WriteBlock::new(
                    source,
                    options.compression.clone(),
                    options.level,
                ));
                self.write_keys.push(key.clone());
                Ok(WriteTarget::Index(self.write_blocks.len() - 1))
            }
        }
    }

    /// The identity of write block `index`'s source buffer.
    pub fn write_key(&self, index: usize) -> &BufferKey {
        &self.write_keys[index]
    }

    /// Install the terminal streamed block.  A second call with a
    /// different buffer fails with `DuplicateStream`.
    pub fn set_streamed_block(&mut self, key: BufferKey, source: BlockSource) -> Result<()> {
        if let Some(existing) = &self.streamed_key {
            if !existing.matches(&key) {
                return Err(AsdfError::DuplicateStream);
            }
            return Ok(());
        }
        self.streamed_block = Some(WriteBlock::new(source, None, -1));
        self.streamed_key = Some(key);
        Ok(())
    }

    /// A lazy payload callback for read block `index`.
    pub fn data_callback(&self, index: usize) -> Rc<DataCallback> {
        Rc::new(DataCallback::new(index, &self.blocks))
    }

    // ── Diagnostics ──────────────────────────────────────────────────────────

    /// The set of codec labels that will appear in the written file, used
    /// to emit extension metadata.
    pub fn get_output_compressions(&self, config: &AsdfConfig) -> BTreeSet<String> {
        let mut labels = BTreeSet::new();
        match &config.all_array_compression {
            OutputCompression::Input => {
                for blk in self.blocks.borrow().iter() {
                    if let Some(label) = blk.header.as_ref().and_then(|h| h.compression.clone()) {
                        labels.insert(label);
                    }
                }
            }
            OutputCompression::Off => {}
            OutputCompression::Label(label) => {
                labels.insert(label.clone());
            }
        }
        for (_, options) in &self.options {
            if let Some(label) = &options.compression {
                labels.insert(label.clone());
            }
        }
        labels
    }
}
