//! HTTP byte-range backend.
//!
//! The first request asks for `Range: bytes=0-`.  A server answering
//! `206 Partial Content` with `Accept-Ranges: bytes` and a known
//! `Content-Length` enables range mode: reads that touch uncached file
//! blocks issue further range GETs, and fetched bytes land in an unlinked
//! temporary file that dies with the connection.  Anything else degrades to
//! a plain forward input stream over the response body.
//!
//! Cached blocks are tracked in a bitset indexed by the internal block
//! size; fetches coalesce adjacent missing blocks into one request.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{AsdfError, Result};

use super::{read_full, GenericFile, DEFAULT_BLOCK_SIZE};

pub struct HttpRangeFile {
    agent: ureq::Agent,
    url: String,
    size: u64,
    /// Unlinked temp file holding every fetched block at its true offset.
    local: File,
    pos: u64,
    /// One bit per `block_size` span of the remote file.
    blocks: Vec<u8>,
    block_size: u64,
}

/// Open an HTTP(S) URI, probing for byte-range support.
pub fn open_http(url: &str) -> Result<GenericFile> {
    let agent = ureq::agent();
    let response = agent
        .get(url)
        .set("Range", "bytes=0-")
        .call()
        .map_err(|e| AsdfError::Http(e.to_string()))?;

    let ranged = response.status() == 206
        && response.header("accept-ranges") == Some("bytes")
        && response.header("content-range").is_some();
    let size = response
        .header("content-length")
        .and_then(|v| v.parse::<u64>().ok());

    let (size, first_chunk) = match (ranged, size) {
        (true, Some(size)) => {
            // Pull one block from the open response, then abandon it; from
            // here on everything goes through explicit range requests.
            let mut reader = response.into_reader();
            let take = size.min(DEFAULT_BLOCK_SIZE as u64) as usize;
            let mut first_chunk = vec![0u8; take];
            let got = read_full(&mut reader, &mut first_chunk)?;
            first_chunk.truncate(got);
            (size, first_chunk)
        }
        _ => {
            // No range support: hand the body over as a one-shot stream.
            let reader = response.into_reader();
            return Ok(GenericFile::from_reader(
                Box::new(reader),
                Some(url.to_string()),
            ));
        }
    };

    let block_size = DEFAULT_BLOCK_SIZE as u64;
    let block_count = size.div_ceil(block_size) as usize;
    let mut inner = HttpRangeFile {
        agent,
        url: url.to_string(),
        size,
        local: tempfile::tempfile()?,
        pos: 0,
        blocks: vec![0u8; block_count.div_ceil(8)],
        block_size,
    };
    inner.local.set_len(size)?;
    if !first_chunk.is_empty() {
        inner.local.write_all(&first_chunk)?;
        for block in 0..first_chunk.len().div_ceil(block_size as usize) {
            inner.mark_block(block);
        }
    }
    Ok(GenericFile::from_http(inner, url.to_string()))
}

impl HttpRangeFile {
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.size as i64 + d,
        };
        if new < 0 {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            )));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }

    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.size.saturating_sub(self.pos);
        let n = (buf.len() as u64).min(available) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.ensure_range(self.pos, self.pos + n as u64)?;
        self.local.seek(SeekFrom::Start(self.pos))?;
        self.local.read_exact(&mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn has_block(&self, block: usize) -> bool {
        self.blocks[block >> 3] & (1 << (block & 0x7)) != 0
    }

    fn mark_block(&mut self, block: usize) {
        self.blocks[block >> 3] |= 1 << (block & 0x7);
    }

    /// Fetch every uncached block overlapping `[start, end)`, coalescing
    /// adjacent misses into single range requests.
    fn ensure_range(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= self.size {
            return Ok(());
        }
        let end = end.min(self.size);
        let first = (start / self.block_size) as usize;
        let last = ((end - 1) / self.block_size) as usize;

        let mut a = first;
        while a <= last {
            while a <= last && self.has_block(a) {
                a += 1;
            }
            if a > last {
                break;
            }
            let mut b = a;
            while b <= last && !self.has_block(b) {
                b += 1;
            }

            let byte_start = a as u64 * self.block_size;
            let byte_end = (b as u64 * self.block_size).min(self.size) - 1;
            let response = self
                .agent
                .get(&self.url)
                .set("Range", &format!("bytes={byte_start}-{byte_end}"))
                .call()
                .map_err(|e| AsdfError::Http(e.to_string()))?;
            if response.status() != 206 {
                return Err(AsdfError::Http(format!(
                    "range request failed with status {}",
                    response.status()
                )));
            }
            let want = (byte_end - byte_start + 1) as usize;
            let mut chunk = vec![0u8; want];
            let got = read_full(&mut response.into_reader(), &mut chunk)?;
            if got != want {
                return Err(AsdfError::Http(format!(
                    "range response truncated: wanted {want} bytes, got {got}"
                )));
            }
            self.local.seek(SeekFrom::Start(byte_start))?;
            self.local.write_all(&chunk)?;
            for block in a..b {
                self.mark_block(block);
            }
            a = b;
        }
        Ok(())
    }
}
