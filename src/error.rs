//! Crate-wide error type.
//!
//! Every fallible operation in the crate returns [`Result`].  The variants
//! mirror the failure surface of the format: structural errors while parsing
//! blocks, integrity failures, compression problems, and the preconditions
//! of in-place updates.  Recoverable conditions (a corrupt block index, a
//! few trailing zero bytes) are logged and worked around where the format
//! allows it; everything here is a hard failure.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AsdfError>;

#[derive(Error, Debug)]
pub enum AsdfError {
    /// Expected block magic (`d3 42 4c 4b`) was not found where required.
    #[error("Invalid block magic at offset {offset}: got {found}")]
    BadMagic { offset: u64, found: String },

    /// The 2-byte header size field is below the packed header size.
    #[error("Block header size {actual} smaller than minimum {minimum}")]
    HeaderTooSmall { actual: u16, minimum: u16 },

    /// A semantic invariant of the block layout does not hold.
    #[error("Block invariant violated: {0}")]
    InvariantViolation(String),

    /// Checksum validation was requested and the MD5 digests differ.
    #[error("Block checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The 4-byte compression label is not known to this build.
    #[error("Unknown compression label {0:?}")]
    UnknownCompression(String),

    /// A compressor or decompressor failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// `read_until` reached the end of the stream without a match.
    #[error("{0} not found")]
    DelimiterNotFound(String),

    /// A lazily loaded payload was accessed after its file was closed.
    #[error("Attempt to read data from closed file")]
    FileClosed,

    /// `update()` called on a file opened read-only.
    #[error("Can not update, file is read-only")]
    ReadOnly,

    /// `update()` called on an in-memory file with no backing path.
    #[error("Can not update, no associated file")]
    NoAssociatedFile,

    /// The end-of-file block index is malformed.  Callers that can fall
    /// back to a serial scan log this and continue; it only surfaces when
    /// the index is read directly.
    #[error("Invalid block index: {0}")]
    InvalidBlockIndex(String),

    /// Non-zero bytes found between the last block and end of file.
    #[error("Invalid trailing bytes after final block: {0:?}")]
    TrailingGarbage(Vec<u8>),

    /// External block storage requested but the main file has no URI to
    /// derive sibling file names from.
    #[error("Can't write external blocks, since URI of main file is unknown")]
    ExternalWriteWithoutUri,

    /// A second, different buffer was installed as the streamed block.
    #[error("Can not add second streaming block")]
    DuplicateStream,

    /// The tree failed schema validation.
    #[error("Schema validation failed: {0}")]
    Validation(String),

    /// The operation is not supported by this kind of file.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
