//! End-of-file block index — O(1) seek to any block.
//!
//! The index is an ASCII marker line followed by one YAML document holding
//! a single sequence of absolute byte offsets, one per internal block, in
//! strictly ascending order:
//!
//! ```text
//! #ASDF BLOCK INDEX
//! %YAML 1.1
//! ---
//! - 1342
//! - 5410
//! ...
//! ```
//!
//! The index is advisory: every block list is reconstructible by scanning
//! forward for block magic without it.  Readers therefore treat any
//! malformed index as absent (warn + serial fallback) rather than failing
//! the whole file.

use std::io::SeekFrom;

use crate::error::{AsdfError, Result};
use crate::generic_io::GenericFile;

/// ASCII marker opening the block index.
pub const INDEX_HEADER: &[u8] = b"#ASDF BLOCK INDEX";

/// Search backward from `max_offset` (default: end of file) for the index
/// marker, scanning file-block-sized windows with an overlap of the marker
/// length.  Returns the absolute offset of the marker, or `None` when the
/// search passes `min_offset` without a hit.
pub fn find_block_index(
    fd: &mut GenericFile,
    min_offset: Option<u64>,
    max_offset: Option<u64>,
) -> Result<Option<u64>> {
    let min_offset = match min_offset {
        Some(o) => o,
        None => fd.tell()?,
    };
    let max_offset = match max_offset {
        Some(o) => o,
        None => fd.seek(SeekFrom::End(0))?,
    };
    let block_size = fd.block_size() as u64;

    let mut buff: Vec<u8> = Vec::new();
    for offset in candidate_offsets(min_offset, max_offset, block_size) {
        fd.seek(SeekFrom::Start(offset))?;
        let mut window = fd.read(block_size as usize)?;
        window.extend_from_slice(&buff);
        if let Some(index) = find_subsequence(&window, INDEX_HEADER) {
            let marker_offset = offset + index as u64;
            if marker_offset >= max_offset {
                return Ok(None);
            }
            return Ok(Some(marker_offset));
        }
        window.truncate(INDEX_HEADER.len());
        buff = window;
    }
    Ok(None)
}

/// Read and validate the index document at `offset` (or the cursor).
///
/// Anything other than a single YAML sequence of strictly increasing
/// non-negative integers is rejected with `InvalidBlockIndex`.
pub fn read_block_index(fd: &mut GenericFile, offset: Option<u64>) -> Result<Vec<u64>> {
    if let Some(offset) = offset {
        fd.seek(SeekFrom::Start(offset))?;
    }
    let marker = fd.read(INDEX_HEADER.len())?;
    if marker != INDEX_HEADER {
        return Err(AsdfError::InvalidBlockIndex(
            "marker not found at index offset".into(),
        ));
    }
    let body = fd.read_to_end()?;
    let offsets: Vec<i64> = serde_yaml::from_slice(&body)
        .map_err(|e| AsdfError::InvalidBlockIndex(format!("failed to parse as yaml: {e}")))?;
    if offsets.iter().any(|&o| o < 0) {
        return Err(AsdfError::InvalidBlockIndex("negative offset".into()));
    }
    if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(AsdfError::InvalidBlockIndex(
            "offsets not strictly increasing".into(),
        ));
    }
    Ok(offsets.into_iter().map(|o| o as u64).collect())
}

/// Write the marker line and the YAML offset list at the cursor (or
/// `offset`).
pub fn write_block_index(
    fd: &mut GenericFile,
    offsets: &[u64],
    offset: Option<u64>,
) -> Result<()> {
    if let Some(offset) = offset {
        fd.seek(SeekFrom::Start(offset))?;
    }
    fd.write(INDEX_HEADER)?;
    fd.write(b"\n%YAML 1.1\n---\n")?;
    let body = serde_yaml::to_string(offsets)?;
    fd.write(body.as_bytes())?;
    fd.write(b"...\n")?;
    Ok(())
}

/// Candidate window offsets from `max_offset` down to `min_offset`, aligned
/// to `block_size`.
fn candidate_offsets(min_offset: u64, max_offset: u64, block_size: u64) -> Vec<u64> {
    let block_size = block_size as i64;
    let min = min_offset as i64;
    // Signed arithmetic: the walk may step below zero before terminating.
    let mut offset = (max_offset as i64 / block_size) * block_size;
    if offset == max_offset as i64 {
        // Nothing can start at the end itself.
        offset -= block_size;
    }
    let mut candidates = Vec::new();
    while offset > min {
        candidates.push(offset as u64);
        offset -= block_size;
    }
    if offset <= min {
        candidates.push(min_offset);
    }
    candidates
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
