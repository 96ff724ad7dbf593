//! Block codec — one magic-prefixed, header-framed, sized payload.
//!
//! # On-disk layout (48-byte packed header, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic           = d3 42 4c 4b  ("\xd3BLK")
//!    4      2   header_size     >= 48          (BE u16, skip unknown extensions)
//!    6      4   flags           0x1=STREAMED   (BE u32)
//!   10      4   compression     4-byte label, NUL padded; all-zero = none
//!   14      8   allocated_size  bytes reserved on disk       (BE u64)
//!   22      8   used_size       bytes meaningful on disk     (BE u64)
//!   30      8   data_size       bytes after decompression    (BE u64)
//!   38     16   checksum        MD5 of decompressed payload; all-zero = unset
//! ```
//!
//! # Endianness
//! Every numeric field is big-endian and unsigned.  The high bit of the
//! magic's first byte forces binary detection in tools that sniff content.
//!
//! # Invariants
//! - `allocated_size >= used_size` always.
//! - Uncompressed blocks have `used_size == data_size`.
//! - Streamed blocks (`flags & 0x1`) are uncompressed, carry all-zero sizes
//!   and checksum on disk, and extend to end of file.
//!
//! # Checksums
//! `checksum` is MD5 over the *decompressed* payload in memory order.  An
//! all-zero digest means "unset" and always validates.

use byteorder::{BigEndian, ByteOrder};
use md5::{Digest, Md5};

use crate::compression::{self, CodecRegistry};
use crate::error::{AsdfError, Result};
use crate::generic_io::{GenericFile, MemView};
use crate::index::INDEX_HEADER;

// ── Constants ────────────────────────────────────────────────────────────────

/// On-disk magic for every block.
pub const BLOCK_MAGIC: [u8; 4] = [0xd3, b'B', b'L', b'K'];

/// Packed size of the block header, excluding magic and the u16 size field.
pub const BLOCK_HEADER_SIZE: usize = 48;

/// Magic + 2-byte header size preceding the packed header.
pub const BLOCK_BOILERPLATE_SIZE: u64 = 6;

/// Block is the terminal streamed block; it extends to end of file.
pub const FLAG_STREAMED: u32 = 0x1;

// ── Block header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub flags: u32,
    /// Canonical codec label; `None` means stored verbatim.
    pub compression: Option<String>,
    pub allocated_size: u64,
    pub used_size: u64,
    pub data_size: u64,
    pub checksum: [u8; 16],
}

impl BlockHeader {
    #[inline]
    pub fn is_streamed(&self) -> bool {
        self.flags & FLAG_STREAMED != 0
    }

    #[inline]
    pub fn checksum_set(&self) -> bool {
        self.checksum != [0u8; 16]
    }

    /// Pack the 48 header bytes (magic and size field not included).
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.flags);
        buf[4..8].copy_from_slice(&compression::to_label_field(self.compression.as_deref()));
        BigEndian::write_u64(&mut buf[8..16], self.allocated_size);
        BigEndian::write_u64(&mut buf[16..24], self.used_size);
        BigEndian::write_u64(&mut buf[24..32], self.data_size);
        buf[32..48].copy_from_slice(&self.checksum);
        buf
    }

    /// Parse and semantically validate a packed header.  Labels are
    /// checked against the file's captured codec registry.
    pub fn parse(buf: &[u8], registry: &CodecRegistry) -> Result<Self> {
        let flags = BigEndian::read_u32(&buf[0..4]);
        let mut label = [0u8; 4];
        label.copy_from_slice(&buf[4..8]);
        let compression = registry.validate(&label)?;
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&buf[32..48]);
        let header = Self {
            flags,
            compression,
            allocated_size: BigEndian::read_u64(&buf[8..16]),
            used_size: BigEndian::read_u64(&buf[16..24]),
            data_size: BigEndian::read_u64(&buf[24..32]),
            checksum,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.is_streamed() {
            if self.compression.is_some() {
                return Err(AsdfError::InvariantViolation(
                    "compression set on a streamed block".into(),
                ));
            }
        } else {
            if self.compression.is_none() && self.used_size != self.data_size {
                return Err(AsdfError::InvariantViolation(format!(
                    "used_size {} and data_size {} must be equal when no compression is used",
                    self.used_size, self.data_size
                )));
            }
            if self.allocated_size < self.used_size {
                return Err(AsdfError::InvariantViolation(format!(
                    "allocated_size {} smaller than used_size {}",
                    self.allocated_size, self.used_size
                )));
            }
        }
        Ok(())
    }
}

// ── Checksums ────────────────────────────────────────────────────────────────

/// MD5 of a payload in memory order.
pub fn calculate_block_checksum(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compare a payload against a header checksum.  Unset checksums pass.
pub fn validate_checksum(header: &BlockHeader, data: &[u8]) -> Result<()> {
    if !header.checksum_set() {
        return Ok(());
    }
    let actual = calculate_block_checksum(data);
    if actual != header.checksum {
        return Err(AsdfError::ChecksumMismatch {
            expected: hex::encode(header.checksum),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────────────────

/// A loaded payload: owned bytes, or a window into the file's mapping.
#[derive(Debug, Clone)]
pub enum BlockData {
    Owned(Vec<u8>),
    Mapped(MemView),
}

impl BlockData {
    /// Materialize the payload as owned bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        match self {
            BlockData::Owned(v) => Ok(v.clone()),
            BlockData::Mapped(view) => view.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BlockData::Owned(v) => v.len(),
            BlockData::Mapped(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read and validate a block header at the cursor (or `at`).
///
/// Returns `Ok(None)` when the stream is exhausted — fewer than 4 bytes
/// remain and all of them are zero, or none remain — or when the next bytes
/// are the block-index marker.  Any other content where magic was expected
/// is `BadMagic`.
pub fn read_block_header(
    fd: &mut GenericFile,
    at: Option<u64>,
    past_magic: bool,
    registry: &CodecRegistry,
) -> Result<Option<BlockHeader>> {
    if let Some(at) = at {
        fd.seek(std::io::SeekFrom::Start(at))?;
    }
    if !past_magic {
        let offset = if fd.seekable() { fd.tell()? } else { 0 };
        let magic = fd.read(4)?;
        if magic.is_empty() || (magic.len() < 4 && magic.iter().all(|&b| b == 0)) {
            return Ok(None);
        }
        if magic == INDEX_HEADER[..4] {
            return Ok(None);
        }
        if magic != BLOCK_MAGIC {
            return Err(AsdfError::BadMagic {
                offset,
                found: hex::encode(&magic),
            });
        }
    }

    let mut size_buf = [0u8; 2];
    fd.read_into(&mut size_buf)?;
    let header_size = BigEndian::read_u16(&size_buf);
    if (header_size as usize) < BLOCK_HEADER_SIZE {
        return Err(AsdfError::HeaderTooSmall {
            actual: header_size,
            minimum: BLOCK_HEADER_SIZE as u16,
        });
    }
    let mut header_buf = vec![0u8; header_size as usize];
    fd.read_into(&mut header_buf)?;
    Ok(Some(BlockHeader::parse(&header_buf, registry)?))
}

/// Read one block payload.
///
/// - Uncompressed + `memmap` + memmap-capable file: a mapped view of
///   exactly `used_size` bytes.
/// - Otherwise an owned buffer, decompressed to exactly `data_size` bytes
///   when a codec label is set.
/// - Streamed blocks read to end of file.
///
/// The cursor always lands at `header_end + allocated_size` afterwards.
pub fn read_block_data(
    fd: &mut GenericFile,
    header: &BlockHeader,
    at: Option<u64>,
    memmap: bool,
    registry: &CodecRegistry,
) -> Result<BlockData> {
    if let Some(at) = at {
        fd.seek(std::io::SeekFrom::Start(at))?;
    }

    if header.is_streamed() {
        return Ok(BlockData::Owned(fd.read_to_end()?));
    }

    match &header.compression {
        Some(label) => {
            let mut decoder = registry.get(label)?.decompressor();
            let mut out = Vec::with_capacity(header.data_size as usize);
            for chunk in fd.read_chunks(header.used_size) {
                decoder.feed(&chunk?, &mut out)?;
            }
            decoder.finish(&mut out)?;
            if out.len() as u64 != header.data_size {
                return Err(AsdfError::InvariantViolation(format!(
                    "decompressed to {} bytes, header declares data_size {}",
                    out.len(),
                    header.data_size
                )));
            }
            fd.fast_forward((header.allocated_size - header.used_size) as i64)?;
            Ok(BlockData::Owned(out))
        }
        None => {
            if memmap && fd.can_memmap() {
                let offset = fd.tell()?;
                let view = fd.memmap_view(offset, header.used_size as usize)?;
                fd.fast_forward(header.allocated_size as i64)?;
                Ok(BlockData::Mapped(view))
            } else {
                let mut buf = vec![0u8; header.used_size as usize];
                fd.read_into(&mut buf)?;
                fd.fast_forward((header.allocated_size - header.used_size) as i64)?;
                Ok(BlockData::Owned(buf))
            }
        }
    }
}

/// Read one whole block: `(offset, header, data_offset, payload)`.
///
/// Expects the magic to have been consumed already.  With `lazy` set
/// (seekable files only) the payload is not read; the cursor skips to the
/// end of the block and the caller defers the read via the returned
/// `data_offset`.
pub fn read_block(
    fd: &mut GenericFile,
    at: Option<u64>,
    memmap: bool,
    lazy: bool,
    registry: &CodecRegistry,
) -> Result<(u64, BlockHeader, u64, Option<BlockData>)> {
    let offset = if let Some(at) = at {
        fd.seek(std::io::SeekFrom::Start(at))?;
        at
    } else if fd.seekable() {
        fd.tell()?
    } else {
        0
    };
    let header = read_block_header(fd, None, true, registry)?
        .ok_or_else(|| AsdfError::InvariantViolation("expected block header".into()))?;
    let data_offset = if fd.seekable() { fd.tell()? } else { 0 };
    if lazy && fd.seekable() {
        if header.is_streamed() {
            fd.seek(std::io::SeekFrom::End(0))?;
        } else {
            fd.fast_forward(header.allocated_size as i64)?;
        }
        Ok((offset, header, data_offset, None))
    } else {
        let data = read_block_data(fd, &header, None, memmap, registry)?;
        Ok((offset, header, data_offset, Some(data)))
    }
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Options for [`write_block`].
#[derive(Debug, Clone, Default)]
pub struct BlockWriteOptions {
    /// Codec label, already canonical.
    pub compression: Option<String>,
    /// Codec level; negative selects the codec default.
    pub level: i32,
    /// Padding factor in `[0.0, 1.0]`.
    pub padding: f64,
    /// Write a terminal streamed block.
    pub stream: bool,
    /// Force an exact allocation (used by in-place updates).  Must be at
    /// least the compressed size.
    pub allocated_size: Option<u64>,
}

/// Extra slack for a block: `ceil(block_size × factor)`, rounded so the
/// padded allocation ends on a block-size multiple.
pub fn calculate_padding(content_size: u64, factor: f64, block_size: u64) -> u64 {
    if factor <= 0.0 || block_size == 0 {
        return 0;
    }
    let extra = (block_size as f64 * factor.min(1.0)).ceil() as u64;
    let target = content_size + extra;
    target.div_ceil(block_size) * block_size - content_size
}

/// Write one complete block (magic, header size, header, payload, zero
/// fill) at the cursor.  Returns the header as written.
pub fn write_block(
    fd: &mut GenericFile,
    data: &[u8],
    opts: &BlockWriteOptions,
    registry: &CodecRegistry,
) -> Result<BlockHeader> {
    let compression = registry.validate_label(opts.compression.as_deref())?;

    let header;
    let payload: Option<Vec<u8>>;
    if opts.stream {
        if compression.is_some() {
            return Err(AsdfError::InvariantViolation(
                "compression set on a streamed block".into(),
            ));
        }
        header = BlockHeader {
            flags: FLAG_STREAMED,
            compression: None,
            allocated_size: 0,
            used_size: 0,
            data_size: 0,
            checksum: [0u8; 16],
        };
        payload = None;
    } else {
        let data_size = data.len() as u64;
        let checksum = calculate_block_checksum(data);
        let (used_size, compressed) = match &compression {
            Some(label) => {
                let buf = registry.compress(data, label, opts.level)?;
                (buf.len() as u64, Some(buf))
            }
            None => (data_size, None),
        };
        let allocated_size = match opts.allocated_size {
            Some(allocated) => allocated,
            None => used_size + calculate_padding(used_size, opts.padding, fd.block_size() as u64),
        };
        if allocated_size < used_size {
            return Err(AsdfError::InvariantViolation(format!(
                "block used size {used_size} larger than allocated size {allocated_size}"
            )));
        }
        header = BlockHeader {
            flags: 0,
            compression,
            allocated_size,
            used_size,
            data_size,
            checksum,
        };
        payload = compressed;
    }

    fd.write(&BLOCK_MAGIC)?;
    let mut size_buf = [0u8; 2];
    BigEndian::write_u16(&mut size_buf, BLOCK_HEADER_SIZE as u16);
    fd.write(&size_buf)?;
    fd.write(&header.to_bytes())?;
    match &payload {
        Some(buf) => fd.write(buf)?,
        None => fd.write_array(data)?,
    }
    if !opts.stream {
        fd.clear(header.allocated_size - header.used_size)?;
    }
    Ok(header)
}
