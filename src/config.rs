//! Per-file configuration.
//!
//! An [`AsdfConfig`] is passed to `AsdfFile::open` / `AsdfFile::write_to`
//! and fixes every knob that affects how blocks are read and written.  The
//! process-wide converter and compressor registries are separate concerns:
//! they are read-mostly tables populated before files are opened, and each
//! `AsdfFile` captures a logical snapshot of both when it is created.

use crate::manager::StorageType;

/// How array compression is chosen at write time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputCompression {
    /// Keep whatever codec each block had when it was read (new arrays are
    /// written uncompressed unless per-array options say otherwise).
    #[default]
    Input,
    /// Strip compression from every block.
    Off,
    /// Force one codec label (`"zlib"`, `"bzp2"`, `"lz4"`) onto every block.
    Label(String),
}

#[derive(Debug, Clone)]
pub struct AsdfConfig {
    /// Defer payload reads until an array is actually accessed.  Requires a
    /// seekable file; non-seekable sources always load eagerly.
    pub lazy_load: bool,
    /// Memory-map uncompressed payloads instead of copying them.
    pub memmap: bool,
    /// Verify the MD5 of every payload as it is loaded.
    pub validate_checksums: bool,
    /// Force one storage class onto every array, overriding per-array
    /// options.  `None` keeps per-array settings.
    pub all_array_storage: Option<StorageType>,
    /// Compression selection for written blocks.
    pub all_array_compression: OutputCompression,
    /// Block padding factor in `[0.0, 1.0]`.  Zero writes no padding; one
    /// reserves a full extra I/O block of slack per block.  Padding buys
    /// room for in-place updates at the price of file size.
    pub pad_blocks: f64,
    /// Emit the end-of-file block index.
    pub write_block_index: bool,
}

impl Default for AsdfConfig {
    fn default() -> Self {
        Self {
            lazy_load:             true,
            memmap:                false,
            validate_checksums:    false,
            all_array_storage:     None,
            all_array_compression: OutputCompression::Input,
            pad_blocks:            0.0,
            write_block_index:     true,
        }
    }
}

impl AsdfConfig {
    /// Clamp and normalize a padding request.  `true` maps to 1.0, `false`
    /// to 0.0; fractional values are clamped into `[0.0, 1.0]`.
    pub fn with_padding(mut self, pad: f64) -> Self {
        self.pad_blocks = pad.clamp(0.0, 1.0);
        self
    }

    pub fn with_validate_checksums(mut self, validate: bool) -> Self {
        self.validate_checksums = validate;
        self
    }

    pub fn with_lazy_load(mut self, lazy: bool) -> Self {
        self.lazy_load = lazy;
        self
    }

    pub fn with_memmap(mut self, memmap: bool) -> Self {
        self.memmap = memmap;
        self
    }
}
