//! Byte-stream abstraction over files, memory buffers, and one-way streams.
//!
//! Everything above this module does I/O through [`GenericFile`], which
//! presents one interface over four kinds of backend:
//!
//! | Backend       | seekable | memmap | length known |
//! |---------------|----------|--------|--------------|
//! | real file     | yes      | yes    | yes          |
//! | memory buffer | yes      | no     | yes          |
//! | input stream  | no       | no     | no           |
//! | output stream | no       | no     | grows        |
//!
//! HTTP sources with byte-range support are a fifth backend implemented in
//! [`http`]; servers without range support degrade to an input stream.
//!
//! # Atomic path writes
//! Opening a path in write mode writes to a sibling temporary file and
//! renames it over the target on `close`.  The rename is atomic on POSIX;
//! a crash before `close` leaves the original file untouched.
//!
//! # Memory mapping
//! The first `memmap_view` request maps the whole file once; views are
//! `(offset, len)` windows holding a weak reference to that mapping.  A
//! view outliving its file fails with `FileClosed` on access instead of
//! touching unmapped memory.
//!
//! # Delimiter scanning
//! [`GenericFile::read_until`] consumes bytes until a regex matches.  A
//! match that ends flush against the scan window is only accepted once
//! `readahead` further bytes are visible (or the stream ended), so a
//! delimiter straddling a read boundary is never missed or cut short.

pub mod http;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use memmap2::Mmap;
use regex::bytes::Regex;

use crate::error::{AsdfError, Result};

/// Fallback preferred I/O chunk when the filesystem block size is unknown.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Shared handle used wherever lazily loaded payloads need to re-read from
/// the file after open returns.
pub type SharedFile = Rc<std::cell::RefCell<GenericFile>>;

// ── Mode ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    ReadWrite,
}

impl FileMode {
    pub fn readable(self) -> bool {
        matches!(self, FileMode::Read | FileMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, FileMode::Write | FileMode::ReadWrite)
    }
}

// ── Memory-mapped views ──────────────────────────────────────────────────────

/// A window into a file's memory mapping.  Holds a weak reference so the
/// mapping dies with the file; access after close fails with `FileClosed`.
#[derive(Debug, Clone)]
pub struct MemView {
    map: Weak<Mmap>,
    offset: usize,
    len: usize,
}

impl MemView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Upgrade to a readable slice.  Fails when the backing file is gone.
    pub fn get(&self) -> Result<MappedSlice> {
        let map = self.map.upgrade().ok_or(AsdfError::FileClosed)?;
        Ok(MappedSlice {
            map,
            offset: self.offset,
            len: self.len,
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.get()?.to_vec())
    }
}

/// An upgraded [`MemView`]: keeps the mapping alive while borrowed.
pub struct MappedSlice {
    map: Rc<Mmap>,
    offset: usize,
    len: usize,
}

impl std::ops::Deref for MappedSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map[self.offset..self.offset + self.len]
    }
}

// ── Backends ─────────────────────────────────────────────────────────────────

enum Backend {
    Real {
        file: File,
        /// Whole-file mapping, created on first `memmap_view` request.
        mmap: Option<Rc<Mmap>>,
    },
    Memory {
        buffer: Vec<u8>,
        pos: usize,
    },
    InputStream {
        reader: Box<dyn Read>,
        /// Bytes returned by an over-read of `read_until`, served first.
        pushback: Vec<u8>,
        pos: u64,
    },
    OutputStream {
        writer: Box<dyn Write>,
        pos: u64,
    },
    Http(http::HttpRangeFile),
}

/// A temporary file waiting to be renamed over its target on close.
struct PendingPersist {
    temp: tempfile::TempPath,
    target: PathBuf,
}

// ── GenericFile ──────────────────────────────────────────────────────────────

pub struct GenericFile {
    backend: Backend,
    mode: FileMode,
    uri: Option<String>,
    block_size: usize,
    closed: bool,
    pending: Option<PendingPersist>,
}

impl GenericFile {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Open a filesystem path.  Write mode goes through a sibling temp file
    /// that replaces the target atomically on `close`; read-write mode opens
    /// the target directly (in-place updates must not be redirected).
    pub fn open_path<P: AsRef<Path>>(path: P, mode: FileMode) -> Result<Self> {
        let path = path.as_ref();
        let uri = Some(path.to_string_lossy().into_owned());
        match mode {
            FileMode::Read => {
                let file = File::open(path)?;
                Ok(Self::from_real(file, mode, uri, None))
            }
            FileMode::ReadWrite => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok(Self::from_real(file, mode, uri, None))
            }
            FileMode::Write => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let temp = tempfile::NamedTempFile::new_in(dir)?;
                let (file, temp_path) = temp.into_parts();
                let pending = PendingPersist {
                    temp: temp_path,
                    target: path.to_owned(),
                };
                Ok(Self::from_real(file, mode, uri, Some(pending)))
            }
        }
    }

    /// Open a URI: `http://` / `https://` dispatch to the range client,
    /// anything else is treated as a filesystem path.
    pub fn open_uri(uri: &str, mode: FileMode) -> Result<Self> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            if mode != FileMode::Read {
                return Err(AsdfError::Unsupported("writing to HTTP URIs"));
            }
            return http::open_http(uri);
        }
        Self::open_path(uri, mode)
    }

    fn from_real(file: File, mode: FileMode, uri: Option<String>, pending: Option<PendingPersist>) -> Self {
        let block_size = fs_block_size(&file);
        Self {
            backend: Backend::Real { file, mmap: None },
            mode,
            uri,
            block_size,
            closed: false,
            pending,
        }
    }

    /// A readable (and, in read-write mode, growable) in-memory buffer.
    pub fn from_bytes(buffer: Vec<u8>, mode: FileMode) -> Self {
        Self {
            backend: Backend::Memory { buffer, pos: 0 },
            mode,
            uri: None,
            block_size: DEFAULT_BLOCK_SIZE,
            closed: false,
            pending: None,
        }
    }

    /// An empty writable memory buffer.
    pub fn memory_writer() -> Self {
        Self::from_bytes(Vec::new(), FileMode::ReadWrite)
    }

    /// A one-shot forward reader with pushback.
    pub fn from_reader(reader: Box<dyn Read>, uri: Option<String>) -> Self {
        Self {
            backend: Backend::InputStream {
                reader,
                pushback: Vec::new(),
                pos: 0,
            },
            mode: FileMode::Read,
            uri,
            block_size: DEFAULT_BLOCK_SIZE,
            closed: false,
            pending: None,
        }
    }

    /// A forward-only writer.
    pub fn from_writer(writer: Box<dyn Write>, uri: Option<String>) -> Self {
        Self {
            backend: Backend::OutputStream { writer, pos: 0 },
            mode: FileMode::Write,
            uri,
            block_size: DEFAULT_BLOCK_SIZE,
            closed: false,
            pending: None,
        }
    }

    pub(crate) fn from_http(inner: http::HttpRangeFile, uri: String) -> Self {
        Self {
            backend: Backend::Http(inner),
            mode: FileMode::Read,
            uri: Some(uri),
            block_size: DEFAULT_BLOCK_SIZE,
            closed: false,
            pending: None,
        }
    }

    // ── Capabilities ─────────────────────────────────────────────────────────

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn set_uri(&mut self, uri: Option<String>) {
        self.uri = uri;
    }

    /// Preferred I/O chunk: the filesystem block size where knowable.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn seekable(&self) -> bool {
        matches!(
            self.backend,
            Backend::Real { .. } | Backend::Memory { .. } | Backend::Http(_)
        )
    }

    pub fn can_memmap(&self) -> bool {
        matches!(self.backend, Backend::Real { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total length, where knowable without consuming the stream.
    pub fn len(&mut self) -> Result<Option<u64>> {
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(Some(file.metadata()?.len())),
            Backend::Memory { buffer, .. } => Ok(Some(buffer.len() as u64)),
            Backend::Http(h) => Ok(Some(h.len())),
            _ => Ok(None),
        }
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Read up to `n` bytes; shorter only at end of stream.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let got = self.read_some(&mut buf)?;
        buf.truncate(got);
        Ok(buf)
    }

    /// Fill `buf` completely or fail with an EOF error.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.read_some(buf)?;
        if got != buf.len() {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, got {got}", buf.len()),
            )));
        }
        Ok(())
    }

    /// Read everything from the cursor to end of stream.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(self.block_size)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(read_full(file, buf)?),
            Backend::Memory { buffer, pos } => {
                let available = buffer.len().saturating_sub(*pos);
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&buffer[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Backend::InputStream {
                reader,
                pushback,
                pos,
            } => {
                let mut filled = 0;
                if !pushback.is_empty() {
                    let n = pushback.len().min(buf.len());
                    buf[..n].copy_from_slice(&pushback[..n]);
                    pushback.drain(..n);
                    filled = n;
                }
                filled += read_full(reader, &mut buf[filled..])?;
                *pos += filled as u64;
                Ok(filled)
            }
            Backend::OutputStream { .. } => Err(AsdfError::Unsupported("read from output stream")),
            Backend::Http(h) => h.read_some(buf),
        }
    }

    /// Yield up to `total` bytes in filesystem-block-sized slabs.
    pub fn read_chunks(&mut self, total: u64) -> ChunkIter<'_> {
        ChunkIter {
            fd: self,
            remaining: total,
        }
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.mode.writable() {
            return Err(AsdfError::Unsupported("write to read-only file"));
        }
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(file.write_all(data)?),
            Backend::Memory { buffer, pos } => {
                let end = *pos + data.len();
                if end > buffer.len() {
                    buffer.resize(end, 0);
                }
                buffer[*pos..end].copy_from_slice(data);
                *pos = end;
                Ok(())
            }
            Backend::OutputStream { writer, pos } => {
                writer.write_all(data)?;
                *pos += data.len() as u64;
                Ok(())
            }
            _ => Err(AsdfError::Unsupported("write to this file kind")),
        }
    }

    /// Write a contiguous byte array.  Exists as a named operation so array
    /// payload writes stay distinguishable from header writes at call sites.
    pub fn write_array(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)
    }

    /// Write `n` zero bytes.
    pub fn clear(&mut self, n: u64) -> Result<()> {
        let zeros = vec![0u8; self.block_size];
        let mut remaining = n;
        while remaining > 0 {
            let step = (zeros.len() as u64).min(remaining) as usize;
            self.write(&zeros[..step])?;
            remaining -= step as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(file.flush()?),
            Backend::OutputStream { writer, .. } => Ok(writer.flush()?),
            _ => Ok(()),
        }
    }

    // ── Position ─────────────────────────────────────────────────────────────

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(file.seek(pos)?),
            Backend::Memory { buffer, pos: cur } => {
                let new = match pos {
                    SeekFrom::Start(o) => o as i64,
                    SeekFrom::Current(d) => *cur as i64 + d,
                    SeekFrom::End(d) => buffer.len() as i64 + d,
                };
                if new < 0 {
                    return Err(AsdfError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "seek before start",
                    )));
                }
                *cur = new as usize;
                Ok(*cur as u64)
            }
            Backend::Http(h) => h.seek(pos),
            _ => Err(AsdfError::Unsupported("seek on non-seekable stream")),
        }
    }

    pub fn tell(&mut self) -> Result<u64> {
        match &mut self.backend {
            Backend::Real { file, .. } => Ok(file.stream_position()?),
            Backend::Memory { pos, .. } => Ok(*pos as u64),
            Backend::InputStream { pos, .. } => Ok(*pos),
            Backend::OutputStream { pos, .. } => Ok(*pos),
            Backend::Http(h) => h.tell(),
        }
    }

    /// Move the position forward by `n` bytes.  Seeks where possible; input
    /// streams read and discard; output streams write zeros.  Negative `n`
    /// means "to the end" on seekable files and is ignored on streams.
    pub fn fast_forward(&mut self, n: i64) -> Result<()> {
        if self.seekable() {
            if n < 0 {
                self.seek(SeekFrom::End(0))?;
            } else {
                self.seek(SeekFrom::Current(n))?;
            }
            return Ok(());
        }
        if matches!(self.backend, Backend::OutputStream { .. }) {
            if n > 0 {
                self.clear(n as u64)?;
            }
            return Ok(());
        }
        if n < 0 {
            // Drain to end.
            while !self.read(self.block_size)?.is_empty() {}
            return Ok(());
        }
        let mut remaining = n as u64;
        while remaining > 0 {
            let step = remaining.min(self.block_size as u64) as usize;
            let got = self.read(step)?;
            if got.is_empty() {
                return Err(AsdfError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "fast_forward past end of stream",
                )));
            }
            remaining -= got.len() as u64;
        }
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Real { file, .. } => {
                file.set_len(size)?;
                file.seek(SeekFrom::Start(size))?;
                Ok(())
            }
            Backend::Memory { buffer, pos } => {
                buffer.truncate(size as usize);
                *pos = (*pos).min(buffer.len());
                Ok(())
            }
            _ => Err(AsdfError::Unsupported("truncate on stream")),
        }
    }

    // ── Memory mapping ───────────────────────────────────────────────────────

    /// Map `len` bytes at `offset` into memory.  The returned view borrows
    /// the file's lifetime; see [`MemView`].
    pub fn memmap_view(&mut self, offset: u64, len: usize) -> Result<MemView> {
        self.check_open()?;
        let Backend::Real { file, mmap } = &mut self.backend else {
            return Err(AsdfError::Unsupported("memmap on this file kind"));
        };
        if mmap.is_none() {
            // Map the whole file once; views are windows into it.
            let map = unsafe { Mmap::map(&*file) }?;
            *mmap = Some(Rc::new(map));
        }
        let map = mmap.as_ref().expect("mapping just created");
        if offset as usize + len > map.len() {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "memmap range past end of file",
            )));
        }
        Ok(MemView {
            map: Rc::downgrade(map),
            offset: offset as usize,
            len,
        })
    }

    // ── Delimiter scanning ───────────────────────────────────────────────────

    /// Read until `delimiter` matches.  The accumulated bytes up to (and,
    /// when `include` is set, through) the match are returned; anything read
    /// beyond the match is pushed back.  Fails with `DelimiterNotFound` at
    /// end of stream unless `must_match` is false, in which case everything
    /// read is returned.
    pub fn read_until(
        &mut self,
        delimiter: &Regex,
        readahead: usize,
        delimiter_name: &str,
        include: bool,
        initial_content: &[u8],
        must_match: bool,
    ) -> Result<Vec<u8>> {
        let mut content = initial_content.to_vec();
        let mut eof = false;
        loop {
            if !eof {
                let chunk = self.read(self.block_size)?;
                eof = chunk.is_empty();
                content.extend_from_slice(&chunk);
            }
            if let Some(m) = delimiter.find(&content) {
                // A match flush against the window end may be a prefix of a
                // longer match; require `readahead` bytes of slack first.
                if eof || m.end() + readahead <= content.len() {
                    let cut = if include { m.end() } else { m.start() };
                    let from_stream = content.len().saturating_sub(initial_content.len());
                    let excess = content.split_off(cut);
                    // Only bytes that actually came from the stream can be
                    // returned to it.
                    let n = excess.len().min(from_stream);
                    self.unread(&excess[excess.len() - n..])?;
                    return Ok(content);
                }
            }
            if eof {
                if must_match {
                    return Err(AsdfError::DelimiterNotFound(delimiter_name.to_string()));
                }
                return Ok(content);
            }
        }
    }

    /// Like [`read_until`](Self::read_until) but discards the scanned bytes.
    /// Returns true when the delimiter was found.
    pub fn seek_until(
        &mut self,
        delimiter: &Regex,
        readahead: usize,
        delimiter_name: &str,
        include: bool,
        must_match: bool,
    ) -> Result<bool> {
        match self.read_until(delimiter, readahead, delimiter_name, include, &[], must_match) {
            Ok(_) => Ok(true),
            Err(AsdfError::DelimiterNotFound(_)) if !must_match => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Return over-read bytes to the stream.
    pub(crate) fn unread(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.seekable() {
            self.seek(SeekFrom::Current(-(data.len() as i64)))?;
            return Ok(());
        }
        if let Backend::InputStream { pushback, pos, .. } = &mut self.backend {
            pushback.splice(0..0, data.iter().copied());
            *pos -= data.len() as u64;
            return Ok(());
        }
        Err(AsdfError::Unsupported("pushback on this file kind"))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(AsdfError::FileClosed)
        } else {
            Ok(())
        }
    }

    /// Discard the file without publishing: pending atomic writes are
    /// deleted instead of renamed over their target.
    pub fn abort(&mut self) {
        // TempPath deletes the temp file on drop.
        self.pending = None;
        if let Backend::Real { mmap, .. } = &mut self.backend {
            *mmap = None;
        }
        self.closed = true;
    }

    /// Flush, atomically publish pending path writes, and invalidate every
    /// outstanding memory-mapped view.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        if let Backend::Real { mmap, .. } = &mut self.backend {
            *mmap = None;
        }
        if let Some(pending) = self.pending.take() {
            pending
                .temp
                .persist(&pending.target)
                .map_err(|e| AsdfError::Io(e.error))?;
        }
        self.closed = true;
        Ok(())
    }
}

impl Drop for GenericFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Chunk iterator ───────────────────────────────────────────────────────────

/// Iterator over block-sized slabs, produced by [`GenericFile::read_chunks`].
pub struct ChunkIter<'a> {
    fd: &'a mut GenericFile,
    remaining: u64,
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let step = self.remaining.min(self.fd.block_size as u64) as usize;
        match self.fd.read(step) {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => {
                self.remaining -= chunk.len() as u64;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

// ── URI helpers ──────────────────────────────────────────────────────────────

/// Resolve `relative` against the directory of `base`.
pub fn resolve_uri(base: &str, relative: &str) -> String {
    if let Some(idx) = base.rfind('/') {
        format!("{}/{}", &base[..idx], relative)
    } else {
        relative.to_string()
    }
}

/// The file stem of a URI, used to derive external block names.
pub fn uri_stem(uri: &str) -> String {
    let name = uri.rsplit('/').next().unwrap_or(uri);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

// ── Internals ────────────────────────────────────────────────────────────────

pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn fs_block_size(file: &File) -> usize {
    use std::os::unix::fs::MetadataExt;
    file.metadata()
        .map(|m| m.blksize() as usize)
        .ok()
        .filter(|&b| b > 0)
        .unwrap_or(DEFAULT_BLOCK_SIZE)
}

#[cfg(not(unix))]
fn fs_block_size(_file: &File) -> usize {
    DEFAULT_BLOCK_SIZE
}
