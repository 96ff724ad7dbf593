//! High-level [`AsdfFile`] API — the primary embedding surface.
//!
//! ```no_run
//! use asdf_rs::{AsdfFile, AsdfConfig, NdArray, Node};
//!
//! // Write
//! let mut af = AsdfFile::new(AsdfConfig::default());
//! af.tree_mut().insert("a", NdArray::from_u8(vec![0, 1, 2, 3]).into());
//! af.write_to_path("out.asdf")?;
//!
//! // Read
//! let mut af = AsdfFile::open("out.asdf", AsdfConfig::default())?;
//! let array = af.tree().get("a").and_then(|n| n.as_array()).unwrap();
//! assert_eq!(array.bytes()?.as_slice(), &[0, 1, 2, 3]);
//! # Ok::<(), asdf_rs::AsdfError>(())
//! ```
//!
//! # File anatomy
//! `#ASDF <version>` header line, `#`-comments (`#ASDF_STANDARD` is
//! recognized), one YAML document framed `%YAML 1.1\n--- …\n...\n`, the
//! binary block section, and the optional block index.  A file holding
//! only the header line is a valid empty tree.
//!
//! # Update
//! [`AsdfFile::update`] rewrites an open read-write file so that reopening
//! it yields the current in-memory tree, reusing on-disk block locations
//! where the layout planner finds a hole-free arrangement and falling back
//! to a full serial rewrite otherwise.  Data safety rule: every payload
//! that must move is materialized in memory before the first byte of the
//! file is overwritten.

use std::cell::RefCell;
use std::io::SeekFrom;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use regex::bytes::Regex;

use crate::block::{self, BlockWriteOptions};
use crate::compression::CodecRegistry;
use crate::config::AsdfConfig;
use crate::error::{AsdfError, Result};
use crate::extension::{self, Converter};
use crate::generic_io::{resolve_uri, FileMode, GenericFile, SharedFile};
use crate::index;
use crate::manager::{BufferKey, Manager};
use crate::reader;
use crate::schema;
use crate::tree::{self, ArraySource, Node};
use crate::update::{self, FixedBlock, FreeBlock, LayoutPlan, BLOCK_OVERHEAD};
use crate::viewer::BlockViewer;
use crate::writer::{self, BlockSource};

// ── Format constants ─────────────────────────────────────────────────────────

/// ASCII magic opening every file.
pub const ASDF_MAGIC: &[u8] = b"#ASDF";

/// File format version written by this build.
pub const ASDF_VERSION: &str = "1.0.0";

/// Standard version advertised in the `#ASDF_STANDARD` comment.
pub const ASDF_STANDARD_VERSION: &str = "1.5.0";

fn newline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n").expect("static regex"))
}

fn yaml_end_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n\.\.\.((\r?\n)|$)").expect("static regex"))
}

// ── AsdfFile ─────────────────────────────────────────────────────────────────

pub struct AsdfFile {
    tree: Node,
    manager: Manager,
    config: AsdfConfig,
    fd: Option<SharedFile>,
    /// File format version, from the header line on read.
    version: String,
    standard_version: Option<String>,
    /// Converter registry as it stood when this file object was created.
    /// Registrations made afterwards never affect this file.
    converters: Vec<Arc<dyn Converter>>,
    /// Codec registry snapshot, captured at the same moment.
    codecs: CodecRegistry,
}

impl std::fmt::Debug for AsdfFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsdfFile")
            .field("version", &self.version)
            .field("standard_version", &self.standard_version)
            .finish_non_exhaustive()
    }
}

impl AsdfFile {
    /// An empty tree with no backing file.  Takes a logical snapshot of
    /// the converter and compressor registries as of this call.
    pub fn new(config: AsdfConfig) -> Self {
        Self {
            tree: Node::mapping(),
            manager: Manager::new(Vec::new(), None),
            config,
            fd: None,
            version: ASDF_VERSION.to_string(),
            standard_version: Some(ASDF_STANDARD_VERSION.to_string()),
            converters: extension::snapshot(),
            codecs: CodecRegistry::snapshot(),
        }
    }

    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open a file read-only.
    pub fn open<P: AsRef<Path>>(path: P, config: AsdfConfig) -> Result<Self> {
        let fd = GenericFile::open_path(path, FileMode::Read)?;
        Self::from_generic_file(fd, config)
    }

    /// Open a file read-write, for [`update`](Self::update).
    pub fn open_rw<P: AsRef<Path>>(path: P, config: AsdfConfig) -> Result<Self> {
        let fd = GenericFile::open_path(path, FileMode::ReadWrite)?;
        Self::from_generic_file(fd, config)
    }

    /// Open any URI — filesystem paths, or `http(s)://` with byte-range
    /// support.
    pub fn open_uri(uri: &str, config: AsdfConfig) -> Result<Self> {
        let fd = GenericFile::open_uri(uri, FileMode::Read)?;
        Self::from_generic_file(fd, config)
    }

    /// Read a tree from an already-constructed [`GenericFile`].  The
    /// converter and compressor registries are snapshotted here, before
    /// anything is parsed.
    pub fn from_generic_file(fd: GenericFile, config: AsdfConfig) -> Result<Self> {
        let converters = extension::snapshot();
        let codecs = CodecRegistry::snapshot();
        let uri = fd.uri().map(str::to_string);
        let fd: SharedFile = Rc::new(RefCell::new(fd));

        let parsed = {
            let mut f = fd.borrow_mut();
            parse_header(&mut f)?
        };

        let lazy = config.lazy_load && fd.borrow().seekable();
        let blocks =
            reader::read_blocks(&fd, config.memmap, lazy, config.validate_checksums, &codecs)?;
        let manager = Manager::new(blocks, uri.clone());

        let tree = match &parsed.document {
            Some(doc) => {
                let value: serde_yaml::Value = serde_yaml::from_slice(doc)?;
                let value = unwrap_root_tag(value);
                let loader = |relative: &str| -> Result<Vec<u8>> {
                    let base = uri.as_deref().ok_or(AsdfError::ExternalWriteWithoutUri)?;
                    read_external_block(&resolve_uri(base, relative), &config, &codecs)
                };
                let node = tree::yaml_to_node(&value, &manager, &loader)?;
                extension::apply_from_tree(node, &converters)?
            }
            None => Node::mapping(),
        };
        schema::validate_tree(&tree)?;

        let file = Self {
            tree,
            manager,
            config,
            fd: Some(fd),
            version: parsed.version,
            standard_version: parsed.standard_version,
            converters,
            codecs,
        };

        if file.config.validate_checksums {
            // Force every payload through its MD5 check now rather than at
            // first array access.
            let mut blocks = file.manager.blocks.borrow_mut();
            for blk in blocks.iter_mut() {
                blk.data()?;
            }
        }
        Ok(file)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn tree(&self) -> &Node {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Node {
        &mut self.tree
    }

    pub fn set_tree(&mut self, tree: Node) {
        self.tree = tree;
    }

    pub fn config(&self) -> &AsdfConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn standard_version(&self) -> Option<&str> {
        self.standard_version.as_deref()
    }

    pub fn uri(&self) -> Option<String> {
        self.fd
            .as_ref()
            .and_then(|fd| fd.borrow().uri().map(str::to_string))
            .or_else(|| self.manager.uri().map(str::to_string))
    }

    /// The block manager (options, callbacks, write slots).
    pub fn manager(&mut self) -> &mut Manager {
        &mut self.manager
    }

    /// Read-only block handles for diagnostics.
    pub fn block_viewer(&self) -> BlockViewer {
        BlockViewer::new(self.manager.blocks.clone())
    }

    /// Append a timestamped entry under `history.entries`.
    pub fn add_history_entry(&mut self, description: &str) {
        let mut entry = Node::mapping();
        entry.insert("description", Node::from(description));
        entry.insert(
            "time",
            Node::from(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string().as_str()),
        );

        if self.tree.get("history").is_none() {
            let mut history = Node::mapping();
            history.insert("entries", Node::Sequence(Vec::new()));
            self.tree.insert("history", history);
        }
        if let Some(history) = self.tree.get_mut("history") {
            if history.get("entries").is_none() {
                history.insert("entries", Node::Sequence(Vec::new()));
            }
            if let Some(Node::Sequence(entries)) = history.get_mut("entries") {
                entries.push(entry);
            }
        }
    }

    /// Close the backing file.  Outstanding lazy payloads and mapped views
    /// fail with `FileClosed` afterwards.
    pub fn close(&mut self) -> Result<()> {
        if let Some(fd) = self.fd.take() {
            fd.borrow_mut().close()?;
        }
        Ok(())
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Write the tree and blocks to `path` (atomically: the bytes land in
    /// a sibling temp file renamed over the target).
    pub fn write_to_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.manager
            .set_uri(Some(path.to_string_lossy().into_owned()));
        let mut fd = GenericFile::open_path(path, FileMode::Write)?;
        match self.write_to_fd(&mut fd) {
            Ok(()) => fd.close(),
            Err(e) => {
                // A half-written temp file must never replace the target.
                fd.abort();
                Err(e)
            }
        }
    }

    /// Write the tree and blocks to an open [`GenericFile`].
    pub fn write_to_fd(&mut self, fd: &mut GenericFile) -> Result<()> {
        self.manager.clear_write_state();
        let tree = extension::apply_to_tree(self.tree.clone(), &self.converters)?;
        schema::validate_tree(&tree)?;

        let value = tree::node_to_yaml(&tree, &mut self.manager, &self.config)?;
        let doc = self.compose_document(&value)?;
        fd.write(&doc)?;
        writer::write_blocks(
            fd,
            &self.manager.write_blocks,
            self.config.pad_blocks,
            self.manager.streamed_block.as_ref(),
            self.config.write_block_index,
            &self.codecs,
        )?;
        fd.flush()?;

        let base_uri = fd.uri().map(str::to_string);
        self.write_external_blocks(base_uri)?;
        self.manager.clear_write_state();
        Ok(())
    }

    /// The serialized prefix: header line, comments, YAML document.
    fn compose_document(&self, value: &serde_yaml::Value) -> Result<Vec<u8>> {
        let mut doc = Vec::new();
        doc.extend_from_slice(ASDF_MAGIC);
        doc.push(b' ');
        doc.extend_from_slice(self.version.as_bytes());
        doc.push(b'\n');
        if let Some(standard) = &self.standard_version {
            doc.extend_from_slice(b"#ASDF_STANDARD ");
            doc.extend_from_slice(standard.as_bytes());
            doc.push(b'\n');
        }
        doc.extend_from_slice(b"%YAML 1.1\n---\n");
        doc.extend_from_slice(serde_yaml::to_string(value)?.as_bytes());
        doc.extend_from_slice(b"...\n");
        Ok(doc)
    }

    /// Materialize every pending external block as a sibling single-block
    /// file.
    fn write_external_blocks(&mut self, base_uri: Option<String>) -> Result<()> {
        if self.manager.external_write_blocks.is_empty() {
            return Ok(());
        }
        let base = base_uri
            .or_else(|| self.manager.uri().map(str::to_string))
            .ok_or(AsdfError::ExternalWriteWithoutUri)?;

        for blk in &self.manager.external_write_blocks {
            let relative = blk.uri.as_deref().expect("external block always carries a uri");
            let target = resolve_uri(&base, relative);
            let mut fd = GenericFile::open_path(&target, FileMode::Write)?;

            let mut doc = Vec::new();
            doc.extend_from_slice(ASDF_MAGIC);
            doc.push(b' ');
            doc.extend_from_slice(self.version.as_bytes());
            doc.push(b'\n');
            doc.extend_from_slice(b"%YAML 1.1\n---\n{}\n...\n");
            fd.write(&doc)?;
            writer::write_blocks(
                &mut fd,
                std::slice::from_ref(blk),
                self.config.pad_blocks,
                None,
                false,
                &self.codecs,
            )?;
            fd.close()?;
        }
        Ok(())
    }

    // ── Update ───────────────────────────────────────────────────────────────

    /// Rewrite the backing file in place so that reopening it yields the
    /// current tree.  Unchanged blocks keep their offsets and checksums
    /// where the layout allows; everything else is rewritten.  Not
    /// cancel-safe: an interruption mid-update can corrupt the file.
    pub fn update(&mut self) -> Result<()> {
        let fd = self.fd.clone().ok_or(AsdfError::NoAssociatedFile)?;
        {
            let f = fd.borrow();
            if !f.mode().writable() {
                return Err(AsdfError::ReadOnly);
            }
            if f.uri().is_none() {
                return Err(AsdfError::NoAssociatedFile);
            }
            if !f.seekable() {
                return Err(AsdfError::Unsupported("update on non-seekable file"));
            }
        }

        self.manager.clear_write_state();
        let tree = extension::apply_to_tree(self.tree.clone(), &self.converters)?;
        schema::validate_tree(&tree)?;
        let value = tree::node_to_yaml(&tree, &mut self.manager, &self.config)?;
        let doc = self.compose_document(&value)?;
        let header_size = doc.len() as u64;
        let block_size = fd.borrow().block_size() as u64;

        // Classify: a write block is fixed when its bytes already live in
        // a read block and nothing layout-affecting changed.
        let mut fixed: Vec<FixedBlock> = Vec::new();
        let mut free_indices: Vec<usize> = Vec::new();
        for i in 0..self.manager.write_blocks.len() {
            let key = self.manager.write_key(i).clone();
            match self.fixed_candidate(i, &key)? {
                Some(entry) => fixed.push(entry),
                None => free_indices.push(i),
            }
        }

        // Demote fixed blocks that the new header prefix would overwrite.
        fixed.sort_by_key(|f| f.offset);
        while fixed.first().map(|f| f.offset < header_size).unwrap_or(false) {
            free_indices.push(fixed.remove(0).write_index);
        }
        free_indices.sort_unstable();

        // Materialize and detach every payload that has to move, before a
        // single byte of the file is overwritten.
        let mut free: Vec<FreeBlock> = Vec::with_capacity(free_indices.len());
        for &i in &free_indices {
            let data = self.manager.write_blocks[i].data()?;
            self.manager.write_blocks[i].source = BlockSource::Buffer(data.clone());
            let used = match &self.manager.write_blocks[i].compression {
                Some(label) => {
                    let level = self.manager.write_blocks[i].level;
                    self.codecs.compress(&data, label, level)?.len() as u64
                }
                None => data.len() as u64,
            };
            free.push(FreeBlock {
                write_index: i,
                used,
            });
        }
        if let Some(streamed) = &mut self.manager.streamed_block {
            let data = streamed.data()?;
            streamed.source = BlockSource::Buffer(data);
        }

        let plan = update::calculate_updated_layout(
            &fixed,
            &free,
            header_size,
            self.config.pad_blocks,
            block_size,
            self.manager.streamed_block.is_some(),
        );

        let new_order: Vec<usize> = match plan {
            LayoutPlan::InPlace(plan) => {
                let mut f = fd.borrow_mut();
                f.seek(SeekFrom::Start(0))?;
                f.write(&doc)?;
                if let Some(&(_, first_offset)) = plan.offsets.first() {
                    // NUL padding up to the first block is the one kind of
                    // leading slack the reader accepts.
                    f.clear(first_offset - header_size)?;
                }
                for pw in &plan.writes {
                    f.seek(SeekFrom::Start(pw.offset))?;
                    let blk = &self.manager.write_blocks[pw.write_index];
                    let data = blk.data()?;
                    block::write_block(
                        &mut f,
                        &data,
                        &BlockWriteOptions {
                            compression: blk.compression.clone(),
                            level: blk.level,
                            allocated_size: Some(pw.allocated),
                            ..Default::default()
                        },
                        &self.codecs,
                    )?;
                }
                f.truncate(plan.end)?;
                if let Some(offset) = plan.streamed_offset {
                    f.seek(SeekFrom::Start(offset))?;
                    let streamed = self
                        .manager
                        .streamed_block
                        .as_ref()
                        .expect("plan carries a streamed offset only when one exists");
                    let data = streamed.data()?;
                    block::write_block(
                        &mut f,
                        &data,
                        &BlockWriteOptions {
                            stream: true,
                            ..Default::default()
                        },
                        &self.codecs,
                    )?;
                } else if !plan.offsets.is_empty() && self.config.write_block_index {
                    f.seek(SeekFrom::Start(plan.end))?;
                    let offsets: Vec<u64> = plan.offsets.iter().map(|&(_, o)| o).collect();
                    index::write_block_index(&mut f, &offsets, None)?;
                }
                f.flush()?;
                plan.offsets.iter().map(|&(i, _)| i).collect()
            }
            LayoutPlan::Serial => {
                // Everything is rewritten; detach any payload still backed
                // by the region about to be overwritten.
                for blk in self.manager.write_blocks.iter_mut() {
                    if let BlockSource::Callback(_) = &blk.source {
                        let data = blk.data()?;
                        blk.source = BlockSource::Buffer(data);
                    }
                }
                let mut f = fd.borrow_mut();
                f.seek(SeekFrom::Start(0))?;
                f.write(&doc)?;
                writer::write_blocks(
                    &mut f,
                    &self.manager.write_blocks,
                    self.config.pad_blocks,
                    self.manager.streamed_block.as_ref(),
                    self.config.write_block_index,
                    &self.codecs,
                )?;
                let end = f.tell()?;
                f.truncate(end)?;
                f.flush()?;
                (0..self.manager.write_blocks.len()).collect()
            }
        };

        let base_uri = self.uri();
        self.write_external_blocks(base_uri)?;
        self.refresh_after_update(&fd, &new_order)?;
        self.manager.clear_write_state();
        Ok(())
    }

    /// Can write block `i` keep its on-disk location?
    fn fixed_candidate(&mut self, i: usize, key: &BufferKey) -> Result<Option<FixedBlock>> {
        let Some(block_index) = self.read_block_for_key(key) else {
            return Ok(None);
        };
        let mut blocks = self.manager.blocks.borrow_mut();
        let Some(read_block) = blocks.get_mut(block_index) else {
            return Ok(None);
        };
        let header = read_block.ensure_header()?.clone();
        drop(blocks);
        if header.is_streamed() {
            return Ok(None);
        }
        if self.manager.write_blocks[i].compression != header.compression {
            return Ok(None);
        }
        let offset = {
            let blocks = self.manager.blocks.borrow();
            blocks[block_index].offset - 4
        };
        Ok(Some(FixedBlock {
            write_index: i,
            offset,
            disk_size: BLOCK_OVERHEAD + header.allocated_size,
        }))
    }

    /// The read block whose payload is (or caches) the buffer behind
    /// `key`.
    fn read_block_for_key(&self, key: &BufferKey) -> Option<usize> {
        match key {
            BufferKey::Block(index) => Some(*index),
            BufferKey::Memory(rc) => self
                .manager
                .blocks
                .borrow()
                .iter()
                .position(|blk| {
                    blk.cached_data()
                        .map(|cached| Rc::ptr_eq(&cached, rc))
                        .unwrap_or(false)
                }),
        }
    }

    /// Re-enumerate the blocks of the rewritten file and re-point every
    /// block-backed array at its new position.
    fn refresh_after_update(&mut self, fd: &SharedFile, new_order: &[usize]) -> Result<()> {
        {
            let mut f = fd.borrow_mut();
            f.seek(SeekFrom::Start(0))?;
            parse_header(&mut f)?;
        }
        let lazy = self.config.lazy_load;
        let new_blocks =
            reader::read_blocks(fd, self.config.memmap, lazy, false, &self.codecs)?;
        *self.manager.blocks.borrow_mut() = new_blocks;

        // write index -> position in the new block order
        let position_of = |write_index: usize| new_order.iter().position(|&w| w == write_index);
        let streamed_position = self.manager.blocks.borrow().len().checked_sub(1);

        let manager = &self.manager;
        self.tree.for_each_array(&mut |array| {
            if let ArraySource::Block(cb) = array.source() {
                let key = array.buffer_key();
                let new_index = if array.streamed {
                    streamed_position
                } else {
                    (0..manager.write_blocks.len())
                        .find(|&i| manager.write_key(i).matches(&key))
                        .and_then(position_of)
                };
                if let Some(new_index) = new_index {
                    cb.reassign(new_index, &manager.blocks);
                }
            }
        });
        Ok(())
    }
}

impl Drop for AsdfFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Header parsing ───────────────────────────────────────────────────────────

struct ParsedHeader {
    version: String,
    standard_version: Option<String>,
    /// Raw YAML document bytes, framing included.
    document: Option<Vec<u8>>,
}

/// Consume the header line, comment lines, and YAML document, leaving the
/// cursor at the first byte of the block section.
fn parse_header(fd: &mut GenericFile) -> Result<ParsedHeader> {
    let line = fd.read_until(newline_regex(), 2, "newline", true, &[], true)?;
    if !line.starts_with(ASDF_MAGIC) {
        return Err(AsdfError::InvariantViolation(
            "does not appear to be an ASDF file".into(),
        ));
    }
    let version = String::from_utf8_lossy(&line[ASDF_MAGIC.len()..])
        .trim()
        .to_string();
    if version.is_empty() {
        return Err(AsdfError::InvariantViolation(
            "header line carries no file format version".into(),
        ));
    }

    let mut standard_version = None;
    loop {
        let peek = fd.read(1)?;
        match peek.first() {
            Some(b'#') => {
                let comment =
                    fd.read_until(newline_regex(), 2, "newline", true, &peek, false)?;
                let comment = String::from_utf8_lossy(&comment);
                let comment = comment.trim_start_matches('#').trim();
                if let Some(rest) = comment.strip_prefix("ASDF_STANDARD") {
                    standard_version = Some(rest.trim().to_string());
                }
            }
            Some(b'%') => {
                fd.unread(&peek)?;
                let document = fd.read_until(
                    yaml_end_marker_regex(),
                    16,
                    "end of YAML marker",
                    true,
                    &[],
                    true,
                )?;
                return Ok(ParsedHeader {
                    version,
                    standard_version,
                    document: Some(document),
                });
            }
            Some(_) => {
                fd.unread(&peek)?;
                break;
            }
            None => break,
        }
    }
    Ok(ParsedHeader {
        version,
        standard_version,
        document: None,
    })
}

/// Strip an `asdf`-flavored root tag so the tree body is what callers see.
fn unwrap_root_tag(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Tagged(tagged) if tagged.tag.to_string().contains("core/asdf") => {
            tagged.value
        }
        other => other,
    }
}

/// Open an external sibling file and return its first block's payload.
/// Codec labels resolve against the parent file's captured registry.
fn read_external_block(
    uri: &str,
    config: &AsdfConfig,
    registry: &CodecRegistry,
) -> Result<Vec<u8>> {
    let fd = GenericFile::open_uri(uri, FileMode::Read)?;
    let fd: SharedFile = Rc::new(RefCell::new(fd));
    {
        let mut f = fd.borrow_mut();
        parse_header(&mut f)?;
    }
    let mut blocks =
        reader::read_blocks(&fd, false, false, config.validate_checksums, registry)?;
    let first = blocks.first_mut().ok_or_else(|| {
        AsdfError::Validation(format!("external file {uri} holds no blocks"))
    })?;
    Ok(first.data()?.as_ref().clone())
}
