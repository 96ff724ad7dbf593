//! Compression registry: 4-byte codec labels + built-in codecs.
//!
//! # Identity rules
//! Every codec is identified by a 4-byte ASCII label, NUL-padded to 4
//! bytes.  That label is written into every compressed block header.  An
//! all-zero label means the payload is stored verbatim.  A reader that
//! encounters a label it cannot supply MUST fail immediately — no fallback,
//! no partial decode.
//!
//! # Built-in labels
//!
//! | Label  | Codec                                             |
//! |--------|---------------------------------------------------|
//! | (zero) | none — payload stored verbatim                    |
//! | `zlib` | RFC 1950                                          |
//! | `bzp2` | bzip2                                             |
//! | `lz4`  | LZ4 block mode with internal record framing       |
//!
//! # LZ4 framing
//! The payload is a concatenation of records, each a big-endian u32
//! compressed length followed by that many bytes of one LZ4 block (which
//! carries its own uncompressed-size prefix).  Input is split into
//! [`LZ4_BLOCK_SIZE`] chunks at compression time; the decoder reassembles
//! records across arbitrary chunk boundaries.
//!
//! # Streaming decode
//! Decoders are stateful objects fed file-block-sized slabs via
//! [`Decompressor::feed`]; `finish` flushes whatever the codec buffers.
//! The caller is responsible for checking that the accumulated output is
//! exactly `data_size` bytes.
//!
//! # Extension codecs and snapshots
//! Additional codecs are contributed process-wide via
//! [`register_compressor`], before any file that uses the label is opened.
//! Every open file resolves labels through a [`CodecRegistry`] captured
//! when the file object was created, so registrations made afterwards
//! never change what an already-open file can encode or decode.

use std::io::{Read, Write};
use std::sync::{Arc, OnceLock, RwLock};

use flate2::{Compression as ZlibLevel, Decompress, FlushDecompress, Status};

use crate::error::{AsdfError, Result};

/// Chunk size for LZ4 record framing: 4 MiB of uncompressed input.
pub const LZ4_BLOCK_SIZE: usize = 1 << 22;

const BUILTIN_LABELS: [&str; 3] = ["zlib", "bzp2", "lz4"];

// ── Label field packing ──────────────────────────────────────────────────────

/// Encode a label as the 4-byte header field, NUL-padded on the left.
pub fn to_label_field(label: Option<&str>) -> [u8; 4] {
    let mut field = [0u8; 4];
    if let Some(label) = label {
        let bytes = label.as_bytes();
        let n = bytes.len().min(4);
        field[4 - n..].copy_from_slice(&bytes[..n]);
    }
    field
}

// ── Compressor / Decompressor traits ─────────────────────────────────────────

pub trait Compressor: Send + Sync {
    /// The 4-byte (or shorter) label written to disk.
    fn label(&self) -> &str;
    /// Compress `data` in one shot.  `level` below zero selects the codec
    /// default.
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>>;
    /// A fresh streaming decoder for this codec.
    fn decompressor(&self) -> Box<dyn Decompressor>;
}

/// Streaming decoder.  `feed` accepts arbitrary chunk boundaries; `finish`
/// flushes any buffered tail.
pub trait Decompressor {
    fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()>;
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()>;
}

// ── Process-wide registration ────────────────────────────────────────────────

fn extra_compressors() -> &'static RwLock<Vec<Arc<dyn Compressor>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<dyn Compressor>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register an additional codec process-wide.  Must be called before any
/// file using the label is opened; the label may not shadow a built-in.
pub fn register_compressor(compressor: Arc<dyn Compressor>) -> Result<()> {
    let label = compressor.label().to_string();
    if label.is_empty() || label.len() > 4 || BUILTIN_LABELS.contains(&label.as_str()) {
        return Err(AsdfError::Compression(format!(
            "can not register compressor with label {label:?}"
        )));
    }
    extra_compressors()
        .write()
        .expect("compressor registry poisoned")
        .push(compressor);
    Ok(())
}

/// Labels of every registered extension compressor, for diagnostics.
pub fn extension_labels() -> Vec<String> {
    extra_compressors()
        .read()
        .expect("compressor registry poisoned")
        .iter()
        .map(|c| c.label().to_string())
        .collect()
}

// ── CodecRegistry snapshot ───────────────────────────────────────────────────

/// The codec table as it stood at one point in time: the built-ins plus
/// whatever extensions were registered when [`snapshot`](Self::snapshot)
/// ran.  An `AsdfFile` captures one at creation and resolves every label
/// through it for the rest of its life.
#[derive(Clone)]
pub struct CodecRegistry {
    extensions: Vec<Arc<dyn Compressor>>,
}

impl CodecRegistry {
    /// Capture the process-wide registry as of now.
    pub fn snapshot() -> Self {
        Self {
            extensions: extra_compressors()
                .read()
                .expect("compressor registry poisoned")
                .clone(),
        }
    }

    fn registered(&self, label: &str) -> Option<Arc<dyn Compressor>> {
        // Later registrations win for a repeated label.
        self.extensions
            .iter()
            .rev()
            .find(|c| c.label() == label)
            .cloned()
    }

    fn is_known(&self, label: &str) -> bool {
        BUILTIN_LABELS.contains(&label) || self.registered(label).is_some()
    }

    /// Resolve a label to a codec.  Fails hard on unknown labels.
    pub fn get(&self, label: &str) -> Result<Arc<dyn Compressor>> {
        if let Some(ext) = self.registered(label) {
            return Ok(ext);
        }
        match label {
            "zlib" => Ok(Arc::new(ZlibCodec)),
            "bzp2" => Ok(Arc::new(Bzp2Codec)),
            "lz4" => Ok(Arc::new(Lz4Codec)),
            other => Err(AsdfError::UnknownCompression(other.to_string())),
        }
    }

    /// Canonicalize a 4-byte header field into a codec label.
    ///
    /// Returns `Ok(None)` for the all-zero field.  Unknown labels fail with
    /// `UnknownCompression`; decoding MUST NOT continue in that case.
    pub fn validate(&self, field: &[u8; 4]) -> Result<Option<String>> {
        if field == &[0u8; 4] {
            return Ok(None);
        }
        let trimmed: Vec<u8> = field.iter().copied().filter(|&b| b != 0).collect();
        let label = String::from_utf8(trimmed)
            .map_err(|_| AsdfError::UnknownCompression(format!("{field:02x?}")))?;
        if self.is_known(&label) {
            Ok(Some(label))
        } else {
            Err(AsdfError::UnknownCompression(label))
        }
    }

    /// Canonicalize an optional label string, checking availability.
    pub fn validate_label(&self, label: Option<&str>) -> Result<Option<String>> {
        match label {
            None => Ok(None),
            Some(l) => {
                let l = l.trim_matches('\0');
                if l.is_empty() {
                    return Ok(None);
                }
                if self.is_known(l) {
                    Ok(Some(l.to_string()))
                } else {
                    Err(AsdfError::UnknownCompression(l.to_string()))
                }
            }
        }
    }

    /// One-shot compression.
    pub fn compress(&self, data: &[u8], label: &str, level: i32) -> Result<Vec<u8>> {
        self.get(label)?.compress(data, level)
    }

    /// One-shot decompression: feed everything, then finish.
    pub fn decompress(&self, data: &[u8], label: &str) -> Result<Vec<u8>> {
        let mut decoder = self.get(label)?.decompressor();
        let mut out = Vec::new();
        decoder.feed(data, &mut out)?;
        decoder.finish(&mut out)?;
        Ok(out)
    }
}

// ── Snapshot-of-now conveniences ─────────────────────────────────────────────

/// [`CodecRegistry::validate`] against the registry as of this call.
pub fn validate(field: &[u8; 4]) -> Result<Option<String>> {
    CodecRegistry::snapshot().validate(field)
}

/// [`CodecRegistry::validate_label`] against the registry as of this call.
pub fn validate_label(label: Option<&str>) -> Result<Option<String>> {
    CodecRegistry::snapshot().validate_label(label)
}

/// [`CodecRegistry::get`] against the registry as of this call.
pub fn get_compressor(label: &str) -> Result<Arc<dyn Compressor>> {
    CodecRegistry::snapshot().get(label)
}

/// [`CodecRegistry::compress`] against the registry as of this call.
pub fn compress(data: &[u8], label: &str, level: i32) -> Result<Vec<u8>> {
    CodecRegistry::snapshot().compress(data, label, level)
}

/// [`CodecRegistry::decompress`] against the registry as of this call.
pub fn decompress(data: &[u8], label: &str) -> Result<Vec<u8>> {
    CodecRegistry::snapshot().decompress(data, label)
}

// ── zlib ─────────────────────────────────────────────────────────────────────

pub struct ZlibCodec;

impl Compressor for ZlibCodec {
    fn label(&self) -> &str {
        "zlib"
    }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let level = if (0..=9).contains(&level) {
            ZlibLevel::new(level as u32)
        } else {
            ZlibLevel::default()
        };
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| AsdfError::Compression(e.to_string()))
    }

    fn decompressor(&self) -> Box<dyn Decompressor> {
        Box::new(ZlibDecompressor {
            inner: Decompress::new(true),
            done: false,
        })
    }
}

struct ZlibDecompressor {
    inner: Decompress,
    done: bool,
}

impl Decompressor for ZlibDecompressor {
    fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !chunk.is_empty() && !self.done {
            if out.capacity() == out.len() {
                out.reserve(64 * 1024);
            }
            let before = self.inner.total_in();
            let status = self
                .inner
                .decompress_vec(chunk, out, FlushDecompress::None)
                .map_err(|e| AsdfError::Compression(e.to_string()))?;
            let consumed = (self.inner.total_in() - before) as usize;
            chunk = &chunk[consumed..];
            if status == Status::StreamEnd {
                self.done = true;
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

// ── bzp2 ─────────────────────────────────────────────────────────────────────

pub struct Bzp2Codec;

impl Compressor for Bzp2Codec {
    fn label(&self) -> &str {
        "bzp2"
    }

    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        let level = if (1..=9).contains(&level) {
            bzip2::Compression::new(level as u32)
        } else {
            bzip2::Compression::best()
        };
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), level);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| AsdfError::Compression(e.to_string()))
    }

    fn decompressor(&self) -> Box<dyn Decompressor> {
        Box::new(Bzp2Decompressor { buffer: Vec::new() })
    }
}

/// bzip2 decoding buffers the full compressed payload and decodes on
/// `finish`; the bit-oriented format gains nothing from partial decode and
/// `used_size` bounds the buffer.
struct Bzp2Decompressor {
    buffer: Vec<u8>,
}

impl Decompressor for Bzp2Decompressor {
    fn feed(&mut self, chunk: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut decoder = bzip2::read::BzDecoder::new(self.buffer.as_slice());
        decoder
            .read_to_end(out)
            .map_err(|e| AsdfError::Compression(e.to_string()))?;
        self.buffer.clear();
        Ok(())
    }
}

// ── lz4 ──────────────────────────────────────────────────────────────────────

pub struct Lz4Codec;

impl Compressor for Lz4Codec {
    fn label(&self) -> &str {
        "lz4"
    }

    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in data.chunks(LZ4_BLOCK_SIZE) {
            let block = lz4_flex::block::compress_prepend_size(chunk);
            out.extend_from_slice(&(block.len() as u32).to_be_bytes());
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    fn decompressor(&self) -> Box<dyn Decompressor> {
        Box::new(Lz4Decompressor {
            partial_len: Vec::new(),
            record_size: None,
            record: Vec::new(),
        })
    }
}

/// Reassembles `(big-endian u32 length, lz4 block)` records across feed
/// boundaries.
struct Lz4Decompressor {
    /// Partially received 4-byte length prefix.
    partial_len: Vec<u8>,
    /// Length of the record currently being filled.
    record_size: Option<usize>,
    /// Bytes of the current record received so far.
    record: Vec<u8>,
}

impl Lz4Decompressor {
    fn decode_record(&mut self, block: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let decoded = lz4_flex::block::decompress_size_prepended(block)
            .map_err(|e| AsdfError::Compression(e.to_string()))?;
        out.extend_from_slice(&decoded);
        self.record_size = None;
        self.record.clear();
        Ok(())
    }
}

impl Decompressor for Lz4Decompressor {
    fn feed(&mut self, mut chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !chunk.is_empty() {
            let size = match self.record_size {
                Some(size) => size,
                None => {
                    let need = 4 - self.partial_len.len();
                    let take = need.min(chunk.len());
                    self.partial_len.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if self.partial_len.len() < 4 {
                        break;
                    }
                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&self.partial_len);
                    self.partial_len.clear();
                    let size = u32::from_be_bytes(len_bytes) as usize;
                    self.record_size = Some(size);
                    size
                }
            };

            if self.record.is_empty() && chunk.len() >= size {
                // Full record available without buffering.
                let (block, rest) = chunk.split_at(size);
                self.decode_record(block, out)?;
                chunk = rest;
            } else {
                let take = (size - self.record.len()).min(chunk.len());
                self.record.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                if self.record.len() == size {
                    let block = std::mem::take(&mut self.record);
                    self.decode_record(&block, out)?;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        if !self.partial_len.is_empty() || self.record_size.is_some() {
            return Err(AsdfError::Compression(
                "truncated lz4 record at end of payload".into(),
            ));
        }
        Ok(())
    }
}
