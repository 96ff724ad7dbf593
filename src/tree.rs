//! In-memory tree model and its tagged-YAML representation.
//!
//! A tree is a [`Node`]: YAML-native scalars and containers plus
//! first-class [`NdArray`] leaves.  Arrays serialize as tagged mappings —
//! `!core/ndarray-1.0.0` — whose `source` field is an integer index into
//! the block section, a relative URI string for an external sibling file,
//! or `-1` for the terminal streamed block; inline arrays carry their
//! elements literally under `data` instead.
//!
//! The encoder asks the block manager for a slot per array
//! (`make_write_block`); the decoder installs lazy block callbacks, so an
//! array's bytes stay on disk until something actually looks at them.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};

use crate::config::{AsdfConfig, OutputCompression};
use crate::error::{AsdfError, Result};
use crate::manager::{BlockOptions, BufferKey, DataCallback, Manager, StorageType, WriteTarget};
use crate::writer::BlockSource;

/// Tag carried by every serialized array node.
pub const NDARRAY_TAG: &str = "core/ndarray-1.0.0";

// ── Scalar types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Uint8 => "uint8",
            ScalarType::Uint16 => "uint16",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int8" => Some(ScalarType::Int8),
            "int16" => Some(ScalarType::Int16),
            "int32" => Some(ScalarType::Int32),
            "int64" => Some(ScalarType::Int64),
            "uint8" => Some(ScalarType::Uint8),
            "uint16" => Some(ScalarType::Uint16),
            "uint32" => Some(ScalarType::Uint32),
            "uint64" => Some(ScalarType::Uint64),
            "float32" => Some(ScalarType::Float32),
            "float64" => Some(ScalarType::Float64),
            _ => None,
        }
    }

    /// Element width in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::Uint8 => 1,
            ScalarType::Int16 | ScalarType::Uint16 => 2,
            ScalarType::Int32 | ScalarType::Uint32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Uint64 | ScalarType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn name(self) -> &'static str {
        match self {
            Endian::Big => "big",
            Endian::Little => "little",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "big" => Some(Endian::Big),
            "little" => Some(Endian::Little),
            _ => None,
        }
    }
}

// ── NdArray ──────────────────────────────────────────────────────────────────

/// Where an array's base byte buffer lives right now.
#[derive(Clone)]
pub enum ArraySource {
    /// Owned in memory.
    Memory(Rc<Vec<u8>>),
    /// Still inside a block of the file being read.
    Block(Rc<DataCallback>),
}

/// A multi-dimensional numeric array over a contiguous byte buffer.
#[derive(Clone)]
pub struct NdArray {
    pub dtype: ScalarType,
    pub byteorder: Endian,
    /// Dimension extents.  For streamed arrays the leading extent is a
    /// placeholder; the real value comes from the terminal block's length.
    pub shape: Vec<u64>,
    /// Serialized with a `*` leading dimension and `source: -1`.
    pub streamed: bool,
    source: ArraySource,
}

impl NdArray {
    /// Wrap owned bytes.  The byte count must match `shape` and `dtype`
    /// for non-streamed arrays.
    pub fn from_bytes(
        dtype: ScalarType,
        byteorder: Endian,
        shape: Vec<u64>,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let expected: u64 = shape.iter().product::<u64>() * dtype.size() as u64;
        if expected != bytes.len() as u64 {
            return Err(AsdfError::InvariantViolation(format!(
                "array of shape {shape:?} and type {} needs {expected} bytes, got {}",
                dtype.name(),
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            byteorder,
            shape,
            streamed: false,
            source: ArraySource::Memory(Rc::new(bytes)),
        })
    }

    /// Convenience: a 1-D uint8 array.
    pub fn from_u8(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            dtype: ScalarType::Uint8,
            byteorder: Endian::Big,
            shape: vec![len],
            streamed: false,
            source: ArraySource::Memory(Rc::new(bytes)),
        }
    }

    pub(crate) fn from_source(
        dtype: ScalarType,
        byteorder: Endian,
        shape: Vec<u64>,
        streamed: bool,
        source: ArraySource,
    ) -> Self {
        Self {
            dtype,
            byteorder,
            shape,
            streamed,
            source,
        }
    }

    pub fn source(&self) -> &ArraySource {
        &self.source
    }

    /// Materialize the underlying bytes (loading from the file if the
    /// array is still block-backed).
    pub fn bytes(&self) -> Result<Rc<Vec<u8>>> {
        match &self.source {
            ArraySource::Memory(rc) => Ok(rc.clone()),
            ArraySource::Block(cb) => cb.call(),
        }
    }

    /// Identity of the base buffer, for options lookup and write dedupe.
    pub fn buffer_key(&self) -> BufferKey {
        match &self.source {
            ArraySource::Memory(rc) => BufferKey::Memory(rc.clone()),
            ArraySource::Block(cb) => BufferKey::Block(cb.index()),
        }
    }

    pub(crate) fn block_source(&self) -> BlockSource {
        match &self.source {
            ArraySource::Memory(rc) => BlockSource::Buffer(rc.clone()),
            ArraySource::Block(cb) => BlockSource::Callback(cb.clone()),
        }
    }

    /// Shape with the streamed leading dimension resolved from the actual
    /// byte count.
    pub fn resolved_shape(&self) -> Result<Vec<u64>> {
        if !self.streamed {
            return Ok(self.shape.clone());
        }
        let bytes = self.bytes()?;
        let inner: u64 = self.shape[1..].iter().product::<u64>() * self.dtype.size() as u64;
        let mut shape = self.shape.clone();
        shape[0] = if inner == 0 {
            bytes.len() as u64 / self.dtype.size() as u64
        } else {
            bytes.len() as u64 / inner
        };
        Ok(shape)
    }
}

impl std::fmt::Debug for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdArray")
            .field("dtype", &self.dtype.name())
            .field("byteorder", &self.byteorder.name())
            .field("shape", &self.shape)
            .field("streamed", &self.streamed)
            .finish()
    }
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.byteorder == other.byteorder
            && self.shape == other.shape
            && self.streamed == other.streamed
            && self.bytes().ok() == other.bytes().ok()
    }
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// One node of the object tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Node>),
    /// Order-preserving mapping with string keys.
    Mapping(Vec<(String, Node)>),
    Array(NdArray),
    /// A tagged value this build has no converter for; round-trips as-is.
    Tagged(String, Box<Node>),
}

impl Node {
    pub fn mapping() -> Node {
        Node::Mapping(Vec::new())
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        match self {
            Node::Mapping(entries) => entries
                .iter_mut()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Insert or replace a mapping entry.  No-op on non-mappings.
    pub fn insert(&mut self, key: &str, value: Node) {
        if let Node::Mapping(entries) = self {
            if let Some(entry) = entries.iter_mut().find(|(k, _)| k == key) {
                entry.1 = value;
            } else {
                entries.push((key.to_string(), value));
            }
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Node::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Depth-first visit of every array in the tree.
    pub fn for_each_array<F: FnMut(&NdArray)>(&self, f: &mut F) {
        match self {
            Node::Array(a) => f(a),
            Node::Sequence(items) => items.iter().for_each(|n| n.for_each_array(f)),
            Node::Mapping(entries) => entries.iter().for_each(|(_, n)| n.for_each_array(f)),
            Node::Tagged(_, inner) => inner.for_each_array(f),
            _ => {}
        }
    }

    /// Depth-first mutable visit of every array in the tree.
    pub fn for_each_array_mut<F: FnMut(&mut NdArray)>(&mut self, f: &mut F) {
        match self {
            Node::Array(a) => f(a),
            Node::Sequence(items) => items.iter_mut().for_each(|n| n.for_each_array_mut(f)),
            Node::Mapping(entries) => {
                entries.iter_mut().for_each(|(_, n)| n.for_each_array_mut(f))
            }
            Node::Tagged(_, inner) => inner.for_each_array_mut(f),
            _ => {}
        }
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Node {
        Node::String(s.to_string())
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Node {
        Node::Int(v)
    }
}

impl From<NdArray> for Node {
    fn from(a: NdArray) -> Node {
        Node::Array(a)
    }
}

// ── Encoding: Node → YAML ────────────────────────────────────────────────────

/// Convert a tree to its YAML value, allocating blocks for arrays along
/// the way via the manager.
pub fn node_to_yaml(node: &Node, manager: &mut Manager, config: &AsdfConfig) -> Result<Value> {
    match node {
        Node::Null => Ok(Value::Null),
        Node::Bool(b) => Ok(Value::from(*b)),
        Node::Int(i) => Ok(Value::from(*i)),
        Node::Float(f) => Ok(Value::from(*f)),
        Node::String(s) => Ok(Value::from(s.as_str())),
        Node::Sequence(items) => {
            let mut seq = Vec::with_capacity(items.len());
            for item in items {
                seq.push(node_to_yaml(item, manager, config)?);
            }
            Ok(Value::Sequence(seq))
        }
        Node::Mapping(entries) => {
            let mut map = Mapping::new();
            for (key, value) in entries {
                map.insert(
                    Value::from(key.as_str()),
                    node_to_yaml(value, manager, config)?,
                );
            }
            Ok(Value::Mapping(map))
        }
        Node::Tagged(tag, inner) => {
            let value = node_to_yaml(inner, manager, config)?;
            Ok(Value::Tagged(Box::new(TaggedValue {
                tag: Tag::new(tag.clone()),
                value,
            })))
        }
        Node::Array(array) => array_to_yaml(array, manager, config),
    }
}

fn effective_options(
    array: &NdArray,
    manager: &mut Manager,
    config: &AsdfConfig,
) -> BlockOptions {
    let key = array.buffer_key();
    let mut options = manager.get_options(&key);
    if let Some(storage) = config.all_array_storage {
        options.storage = storage;
    }
    if array.streamed {
        // A streamed array is the terminal block no matter what the global
        // storage override says.
        options.storage = StorageType::Streamed;
    }
    match &config.all_array_compression {
        OutputCompression::Input => {}
        OutputCompression::Off => options.compression = None,
        OutputCompression::Label(label) => options.compression = Some(label.clone()),
    }
    if options.storage == StorageType::Streamed {
        // Streamed blocks are never compressed.
        options.compression = None;
    }
    options
}

fn array_to_yaml(array: &NdArray, manager: &mut Manager, config: &AsdfConfig) -> Result<Value> {
    let options = effective_options(array, manager, config);
    let key = array.buffer_key();
    let target = manager.make_write_block(&key, array.block_source(), &options)?;

    let mut map = Mapping::new();
    match target {
        WriteTarget::Index(index) => {
            map.insert(Value::from("source"), Value::from(index as u64));
        }
        WriteTarget::ExternalUri(uri) => {
            map.insert(Value::from("source"), Value::from(uri.as_str()));
        }
        WriteTarget::Streamed => {
            map.insert(Value::from("source"), Value::from(-1i64));
        }
        WriteTarget::Inline => {
            let bytes = array.bytes()?;
            map.insert(
                Value::from("data"),
                inline_encode(&bytes, array.dtype, array.byteorder, &array.shape)?,
            );
        }
    }
    map.insert(Value::from("datatype"), Value::from(array.dtype.name()));
    map.insert(Value::from("byteorder"), Value::from(array.byteorder.name()));

    let streamed = array.streamed || matches!(options.storage, StorageType::Streamed);
    let mut shape = Vec::with_capacity(array.shape.len());
    for (i, &dim) in array.shape.iter().enumerate() {
        if i == 0 && streamed {
            shape.push(Value::from("*"));
        } else {
            shape.push(Value::from(dim));
        }
    }
    map.insert(Value::from("shape"), Value::Sequence(shape));

    Ok(Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(NDARRAY_TAG),
        value: Value::Mapping(map),
    })))
}

// ── Decoding: YAML → Node ────────────────────────────────────────────────────

/// Resolver for external-block URIs, supplied by the file layer.
pub type ExternalLoader<'a> = dyn Fn(&str) -> Result<Vec<u8>> + 'a;

/// Convert a parsed YAML document back into a tree, installing lazy block
/// callbacks for internal array sources.
pub fn yaml_to_node(
    value: &Value,
    manager: &Manager,
    external: &ExternalLoader<'_>,
) -> Result<Node> {
    match value {
        Value::Null => Ok(Node::Null),
        Value::Bool(b) => Ok(Node::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Node::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Node::Float(f))
            } else {
                Err(AsdfError::Validation(format!("unrepresentable number {n}")))
            }
        }
        Value::String(s) => Ok(Node::String(s.clone())),
        Value::Sequence(items) => {
            let mut seq = Vec::with_capacity(items.len());
            for item in items {
                seq.push(yaml_to_node(item, manager, external)?);
            }
            Ok(Node::Sequence(seq))
        }
        Value::Mapping(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                let key = key
                    .as_str()
                    .ok_or_else(|| AsdfError::Validation("non-string mapping key".into()))?;
                entries.push((key.to_string(), yaml_to_node(value, manager, external)?));
            }
            Ok(Node::Mapping(entries))
        }
        Value::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            if tag.contains("core/ndarray") {
                return yaml_to_array(&tagged.value, manager, external);
            }
            let inner = yaml_to_node(&tagged.value, manager, external)?;
            Ok(Node::Tagged(tag.trim_start_matches('!').to_string(), Box::new(inner)))
        }
    }
}

fn yaml_to_array(
    value: &Value,
    manager: &Manager,
    external: &ExternalLoader<'_>,
) -> Result<Node> {
    let map = value
        .as_mapping()
        .ok_or_else(|| AsdfError::Validation("ndarray node is not a mapping".into()))?;
    let field = |name: &str| map.get(Value::from(name));

    let dtype = field("datatype")
        .and_then(Value::as_str)
        .and_then(ScalarType::from_name)
        .ok_or_else(|| AsdfError::Validation("ndarray with missing or unknown datatype".into()))?;
    let byteorder = field("byteorder")
        .and_then(Value::as_str)
        .and_then(Endian::from_name)
        .unwrap_or(Endian::Big);

    let mut streamed = false;
    let mut shape: Vec<u64> = Vec::new();
    if let Some(Value::Sequence(dims)) = field("shape") {
        for (i, dim) in dims.iter().enumerate() {
            match dim {
                Value::String(s) if s == "*" && i == 0 => {
                    streamed = true;
                    shape.push(0);
                }
                Value::Number(n) => shape.push(n.as_u64().ok_or_else(|| {
                    AsdfError::Validation(format!("bad shape entry {n}"))
                })?),
                other => {
                    return Err(AsdfError::Validation(format!("bad shape entry {other:?}")))
                }
            }
        }
    }

    let source = match field("source") {
        Some(Value::Number(n)) => {
            let index = n
                .as_i64()
                .ok_or_else(|| AsdfError::Validation(format!("bad source {n}")))?;
            let blocks = manager.blocks.borrow();
            let resolved = if index < 0 {
                // The streamed block is by definition the last one.
                streamed = true;
                blocks
                    .len()
                    .checked_sub(1)
                    .ok_or_else(|| AsdfError::Validation("streamed source with no blocks".into()))?
            } else {
                let index = index as usize;
                if index >= blocks.len() {
                    return Err(AsdfError::Validation(format!(
                        "block source {index} out of range ({} blocks)",
                        blocks.len()
                    )));
                }
                index
            };
            drop(blocks);
            ArraySource::Block(manager.data_callback(resolved))
        }
        Some(Value::String(uri)) => {
            let bytes = external(uri)?;
            ArraySource::Memory(Rc::new(bytes))
        }
        Some(other) => {
            return Err(AsdfError::Validation(format!("bad ndarray source {other:?}")))
        }
        None => {
            let data = field("data")
                .ok_or_else(|| AsdfError::Validation("ndarray with no source and no data".into()))?;
            let bytes = inline_decode(data, dtype, byteorder)?;
            if shape.is_empty() {
                shape = inline_shape(data);
            }
            ArraySource::Memory(Rc::new(bytes))
        }
    };

    if streamed && shape.is_empty() {
        shape.push(0);
    }

    Ok(Node::Array(NdArray::from_source(
        dtype, byteorder, shape, streamed, source,
    )))
}

// ── Inline element codec ─────────────────────────────────────────────────────

/// Encode raw bytes as nested YAML sequences following `shape`.
pub fn inline_encode(
    bytes: &[u8],
    dtype: ScalarType,
    byteorder: Endian,
    shape: &[u64],
) -> Result<Value> {
    let width = dtype.size();
    if shape.len() <= 1 {
        let mut out = Vec::with_capacity(bytes.len() / width);
        for chunk in bytes.chunks_exact(width) {
            out.push(scalar_to_yaml(chunk, dtype, byteorder));
        }
        return Ok(Value::Sequence(out));
    }
    let inner: u64 = shape[1..].iter().product::<u64>() * width as u64;
    if inner == 0 {
        let empty = inline_encode(&[], dtype, byteorder, &shape[1..])?;
        return Ok(Value::Sequence(vec![empty; shape[0] as usize]));
    }
    let mut out = Vec::with_capacity(shape[0] as usize);
    for chunk in bytes.chunks(inner as usize) {
        out.push(inline_encode(chunk, dtype, byteorder, &shape[1..])?);
    }
    Ok(Value::Sequence(out))
}

/// Decode nested YAML sequences into raw bytes.
pub fn inline_decode(value: &Value, dtype: ScalarType, byteorder: Endian) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    inline_decode_into(value, dtype, byteorder, &mut out)?;
    Ok(out)
}

fn inline_decode_into(
    value: &Value,
    dtype: ScalarType,
    byteorder: Endian,
    out: &mut Vec<u8>,
) -> Result<()> {
    match value {
        Value::Sequence(items) => {
            for item in items {
                inline_decode_into(item, dtype, byteorder, out)?;
            }
            Ok(())
        }
        scalar => yaml_to_scalar(scalar, dtype, byteorder, out),
    }
}

/// Shape of a nested inline sequence.
fn inline_shape(value: &Value) -> Vec<u64> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Sequence(items) = cursor {
        shape.push(items.len() as u64);
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }
    shape
}

fn scalar_to_yaml(bytes: &[u8], dtype: ScalarType, byteorder: Endian) -> Value {
    macro_rules! read {
        ($method:ident) => {
            match byteorder {
                Endian::Big => BigEndian::$method(bytes),
                Endian::Little => LittleEndian::$method(bytes),
            }
        };
    }
    match dtype {
        ScalarType::Int8 => Value::from(bytes[0] as i8 as i64),
        ScalarType::Uint8 => Value::from(bytes[0] as u64),
        ScalarType::Int16 => Value::from(read!(read_i16) as i64),
        ScalarType::Uint16 => Value::from(read!(read_u16) as u64),
        ScalarType::Int32 => Value::from(read!(read_i32) as i64),
        ScalarType::Uint32 => Value::from(read!(read_u32) as u64),
        ScalarType::Int64 => Value::from(read!(read_i64)),
        ScalarType::Uint64 => Value::from(read!(read_u64)),
        ScalarType::Float32 => Value::from(read!(read_f32) as f64),
        ScalarType::Float64 => Value::from(read!(read_f64)),
    }
}

fn yaml_to_scalar(
    value: &Value,
    dtype: ScalarType,
    byteorder: Endian,
    out: &mut Vec<u8>,
) -> Result<()> {
    let number = value
        .as_f64()
        .or_else(|| value.as_i64().map(|i| i as f64))
        .or_else(|| value.as_u64().map(|u| u as f64));
    let int = value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|u| i64::try_from(u).ok()));

    let mut buf = [0u8; 8];
    macro_rules! write {
        ($method:ident, $v:expr, $n:expr) => {{
            match byteorder {
                Endian::Big => BigEndian::$method(&mut buf[..$n], $v),
                Endian::Little => LittleEndian::$method(&mut buf[..$n], $v),
            }
            out.extend_from_slice(&buf[..$n]);
        }};
    }

    let bad = || AsdfError::Validation(format!("bad inline element {value:?}"));
    match dtype {
        ScalarType::Int8 => out.push(int.ok_or_else(bad)? as i8 as u8),
        ScalarType::Uint8 => out.push(int.ok_or_else(bad)? as u8),
        ScalarType::Int16 => write!(write_i16, int.ok_or_else(bad)? as i16, 2),
        ScalarType::Uint16 => write!(write_u16, int.ok_or_else(bad)? as u16, 2),
        ScalarType::Int32 => write!(write_i32, int.ok_or_else(bad)? as i32, 4),
        ScalarType::Uint32 => write!(write_u32, int.ok_or_else(bad)? as u32, 4),
        ScalarType::Int64 => write!(write_i64, int.ok_or_else(bad)?, 8),
        ScalarType::Uint64 => write!(
            write_u64,
            value.as_u64().or_else(|| int.map(|i| i as u64)).ok_or_else(bad)?,
            8
        ),
        ScalarType::Float32 => write!(write_f32, number.ok_or_else(bad)? as f32, 4),
        ScalarType::Float64 => write!(write_f64, number.ok_or_else(bad)?, 8),
    }
    Ok(())
}
