//! # asdf-rs — ASDF scientific data container reference implementation
//!
//! Format guarantees (frozen for file format 1.x):
//! - The file opens with the ASCII line `#ASDF <version>`; a file holding
//!   only that line is a valid empty tree
//! - Every numeric block-header field is big-endian and unsigned
//! - Every block is self-describing: magic, header size, codec label,
//!   allocated/used/data sizes, MD5 of the decompressed payload
//! - Codec identity is a 4-byte label (`zlib`, `bzp2`, `lz4`, all-zero for
//!   none); readers fail immediately on labels they cannot supply — no
//!   fallback, no partial decode
//! - The block index at end of file is advisory: the full block list is
//!   reconstructible by scanning forward for block magic, and any index
//!   defect degrades to that scan with a warning
//! - At most one block carries the STREAMED flag; it is last and extends
//!   to end of file regardless of its recorded sizes
//! - In-place update never truncates a payload before its new image is
//!   safely in memory or on disk

pub mod block;
pub mod compression;
pub mod config;
pub mod error;
pub mod extension;
pub mod file;
pub mod generic_io;
pub mod index;
pub mod manager;
pub mod reader;
pub mod schema;
pub mod tree;
mod update;
pub mod viewer;
pub mod writer;

// Flat re-exports for the most common types.
pub use block::{BlockHeader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, FLAG_STREAMED};
pub use compression::{register_compressor, CodecRegistry, Compressor, Decompressor};
pub use config::{AsdfConfig, OutputCompression};
pub use error::{AsdfError, Result};
pub use extension::{register_converter, Converter};
pub use file::{AsdfFile, ASDF_MAGIC, ASDF_STANDARD_VERSION, ASDF_VERSION};
pub use generic_io::{FileMode, GenericFile, MemView};
pub use index::INDEX_HEADER;
pub use manager::{BlockOptions, StorageType};
pub use schema::{Validator, Violation};
pub use tree::{Endian, NdArray, Node, ScalarType};
pub use viewer::{BlockView, BlockViewer};
