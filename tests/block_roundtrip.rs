use std::rc::Rc;
use std::sync::Arc;

use asdf_rs::block::calculate_block_checksum;
use asdf_rs::file::AsdfFile;
use asdf_rs::manager::{BlockOptions, StorageType};
use asdf_rs::tree::{Endian, NdArray, Node, ScalarType};
use asdf_rs::{
    register_compressor, AsdfConfig, AsdfError, Compressor, Decompressor, BLOCK_MAGIC,
    FLAG_STREAMED,
};

use proptest::prelude::*;

fn write_simple(dir: &std::path::Path, name: &str, entries: &[(&str, Vec<u8>)]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut af = AsdfFile::new(AsdfConfig::default());
    for (key, bytes) in entries {
        af.tree_mut().insert(key, NdArray::from_u8(bytes.clone()).into());
    }
    af.write_to_path(&path).unwrap();
    path
}

fn count_magic(bytes: &[u8]) -> usize {
    bytes.windows(4).filter(|w| *w == BLOCK_MAGIC).count()
}

#[test]
fn test_roundtrip_tiny_array() {
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0u8..8).collect();
    let path = write_simple(dir.path(), "tiny.asdf", &[("a", payload.clone())]);

    let raw = std::fs::read(&path).unwrap();
    assert!(raw.starts_with(b"#ASDF 1."));
    assert_eq!(count_magic(&raw), 1);

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let viewer = af.block_viewer();
    assert_eq!(viewer.len(), 1);
    let header = viewer.get(0).unwrap().header().unwrap();
    assert_eq!(header.allocated_size, 8);
    assert_eq!(header.used_size, 8);
    assert_eq!(header.data_size, 8);
    assert_eq!(header.checksum, calculate_block_checksum(&payload));

    let array = af.tree().get("a").and_then(Node::as_array).unwrap();
    assert_eq!(array.bytes().unwrap().as_slice(), payload.as_slice());
}

#[test]
fn test_checksum_detect() {
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0u8..8).collect();
    let path = write_simple(dir.path(), "corrupt.asdf", &[("a", payload)]);

    // Flip one byte inside the payload (right after magic + size + header).
    let mut raw = std::fs::read(&path).unwrap();
    let magic_at = raw
        .windows(4)
        .position(|w| w == BLOCK_MAGIC)
        .expect("file contains one block");
    let payload_at = magic_at + 4 + 2 + asdf_rs::BLOCK_HEADER_SIZE;
    raw[payload_at] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    let result = AsdfFile::open(&path, AsdfConfig::default().with_validate_checksums(true));
    match result {
        Err(AsdfError::ChecksumMismatch { .. }) => {}
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
}

#[test]
fn test_zlib_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zlib.asdf");
    let payload = vec![1u8; 1024];

    let mut af = AsdfFile::new(AsdfConfig::default());
    let array = NdArray::from_u8(payload.clone());
    let key = array.buffer_key();
    af.tree_mut().insert("ones", array.into());
    af.manager()
        .set_options(
            key,
            BlockOptions {
                storage: StorageType::Internal,
                compression: Some("zlib".to_string()),
                level: -1,
            },
        )
        .unwrap();
    af.write_to_path(&path).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let header = af.block_viewer().get(0).unwrap().header().unwrap();
    assert_eq!(header.compression.as_deref(), Some("zlib"));
    assert_eq!(header.data_size, 1024);
    assert!(header.used_size < header.data_size);

    let array = af.tree().get("ones").and_then(Node::as_array).unwrap();
    let bytes = array.bytes().unwrap();
    assert_eq!(bytes.len(), 1024);
    assert!(bytes.iter().all(|&b| b == 1));
}

#[test]
fn test_streamed_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streamed.asdf");
    let n = 10_000usize;

    let mut af = AsdfFile::new(AsdfConfig::default());
    let mut array = NdArray::from_u8(vec![7u8; n]);
    array.streamed = true;
    af.tree_mut().insert("s", array.into());
    af.write_to_path(&path).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let viewer = af.block_viewer();
    assert_eq!(viewer.len(), 1);
    let header = viewer.get(0).unwrap().header().unwrap();
    assert_ne!(header.flags & FLAG_STREAMED, 0);
    assert_eq!(header.data_size, 0);

    let array = af.tree().get("s").and_then(Node::as_array).unwrap();
    assert!(array.streamed);
    assert_eq!(array.bytes().unwrap().len(), n);
    assert_eq!(array.resolved_shape().unwrap(), vec![n as u64]);
}

#[test]
fn test_zero_length_streamed_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty_stream.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    let mut array = NdArray::from_u8(Vec::new());
    array.streamed = true;
    af.tree_mut().insert("s", array.into());
    af.write_to_path(&path).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let array = af.tree().get("s").and_then(Node::as_array).unwrap();
    assert_eq!(array.bytes().unwrap().len(), 0);
}

#[test]
fn test_header_only_file_is_empty_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bare.asdf");
    std::fs::write(&path, b"#ASDF 1.0.0\n").unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(af.tree(), &Node::mapping());
    assert_eq!(af.block_viewer().len(), 0);
}

#[test]
fn test_corrupt_block_index_falls_back_to_serial() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_simple(
        dir.path(),
        "two.asdf",
        &[("a", vec![1u8; 32]), ("b", vec![2u8; 64])],
    );

    // Garbage after the block index makes the index document unparseable.
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(b"junk");
    std::fs::write(&path, &raw).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(af.block_viewer().len(), 2);
    let a = af.tree().get("a").and_then(Node::as_array).unwrap();
    let b = af.tree().get("b").and_then(Node::as_array).unwrap();
    assert_eq!(a.bytes().unwrap().as_slice(), &[1u8; 32]);
    assert_eq!(b.bytes().unwrap().as_slice(), &[2u8; 64]);
}

#[test]
fn test_lazy_payload_after_close_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_simple(dir.path(), "lazy.asdf", &[("a", vec![9u8; 128])]);

    let mut af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let array = af
        .tree()
        .get("a")
        .and_then(Node::as_array)
        .unwrap()
        .clone();
    af.close().unwrap();
    match array.bytes() {
        Err(AsdfError::FileClosed) => {}
        other => panic!("expected FileClosed, got {other:?}"),
    }
}

#[test]
fn test_inline_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inline.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    let array = NdArray::from_bytes(
        ScalarType::Int16,
        Endian::Big,
        vec![2, 2],
        vec![0x01, 0x02, 0xff, 0xfe, 0x00, 0x10, 0x7f, 0xff],
    )
    .unwrap();
    let key = array.buffer_key();
    af.tree_mut().insert("m", array.clone().into());
    af.manager()
        .set_options(
            key,
            BlockOptions {
                storage: StorageType::Inline,
                compression: None,
                level: -1,
            },
        )
        .unwrap();
    af.write_to_path(&path).unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(count_magic(&raw), 0, "inline files carry no blocks");

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let read_back = af.tree().get("m").and_then(Node::as_array).unwrap();
    assert_eq!(read_back, &array);
}

#[test]
fn test_external_storage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.asdf");
    let payload = vec![42u8; 256];

    let mut af = AsdfFile::new(AsdfConfig::default());
    let array = NdArray::from_u8(payload.clone());
    let key = array.buffer_key();
    af.tree_mut().insert("x", array.into());
    af.manager()
        .set_options(
            key,
            BlockOptions {
                storage: StorageType::External,
                compression: None,
                level: -1,
            },
        )
        .unwrap();
    af.write_to_path(&path).unwrap();

    let sibling = dir.path().join("main0000.asdf");
    assert!(sibling.exists(), "external block file must be materialized");

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let array = af.tree().get("x").and_then(Node::as_array).unwrap();
    assert_eq!(array.bytes().unwrap().as_slice(), payload.as_slice());
}

#[test]
fn test_duplicate_buffers_share_one_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.asdf");
    let buffer = Rc::new(vec![5u8; 64]);

    let mut af = AsdfFile::new(AsdfConfig::default());
    let a = NdArray::from_u8((*buffer).clone());
    // Two tree entries over the *same* buffer.
    let shared = a.clone();
    af.tree_mut().insert("a", a.into());
    af.tree_mut().insert("b", shared.into());
    af.write_to_path(&path).unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(count_magic(&raw), 1, "identical buffers are deduplicated");
}

#[test]
fn test_metadata_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.asdf");

    let mut af = AsdfFile::new(AsdfConfig::default());
    af.tree_mut().insert("name", Node::from("survey-7"));
    af.tree_mut().insert("count", Node::from(1234i64));
    af.tree_mut().insert(
        "nested",
        Node::Sequence(vec![Node::from(1i64), Node::Float(2.5), Node::Null]),
    );
    af.tree_mut()
        .insert("data", NdArray::from_u8(vec![8u8; 16]).into());
    af.add_history_entry("initial import");
    let original = af.tree().clone();
    af.write_to_path(&path).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    assert_eq!(af.tree(), &original);
}

#[test]
fn test_compressor_registry_snapshot_per_file() {
    struct FakeCodec;
    impl Compressor for FakeCodec {
        fn label(&self) -> &str {
            "fake"
        }
        fn compress(&self, data: &[u8], _level: i32) -> asdf_rs::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
        fn decompressor(&self) -> Box<dyn Decompressor> {
            struct Passthrough;
            impl Decompressor for Passthrough {
                fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> asdf_rs::Result<()> {
                    out.extend_from_slice(chunk);
                    Ok(())
                }
                fn finish(&mut self, _out: &mut Vec<u8>) -> asdf_rs::Result<()> {
                    Ok(())
                }
            }
            Box::new(Passthrough)
        }
    }

    let dir = tempfile::tempdir().unwrap();

    let fake_options = || BlockOptions {
        storage: StorageType::Internal,
        compression: Some("fake".to_string()),
        level: -1,
    };

    // File object created before the registration: its snapshot must not
    // know the codec.
    let mut before = AsdfFile::new(AsdfConfig::default());
    let array = NdArray::from_u8(vec![6u8; 64]);
    let key = array.buffer_key();
    before.tree_mut().insert("a", array.into());
    before.manager().set_options(key, fake_options()).unwrap();

    register_compressor(Arc::new(FakeCodec)).unwrap();

    match before.write_to_path(dir.path().join("before.asdf")) {
        Err(AsdfError::UnknownCompression(label)) => assert_eq!(label, "fake"),
        other => panic!("expected UnknownCompression from the older snapshot, got {other:?}"),
    }

    // File object created after the registration sees it.
    let path = dir.path().join("after.asdf");
    let mut after = AsdfFile::new(AsdfConfig::default());
    let array = NdArray::from_u8(vec![6u8; 64]);
    let key = array.buffer_key();
    after.tree_mut().insert("a", array.into());
    after.manager().set_options(key, fake_options()).unwrap();
    after.write_to_path(&path).unwrap();

    let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
    let header = af.block_viewer().get(0).unwrap().header().unwrap();
    assert_eq!(header.compression.as_deref(), Some("fake"));
    let array = af.tree().get("a").and_then(Node::as_array).unwrap();
    assert_eq!(array.bytes().unwrap().as_slice(), &[6u8; 64]);
}

proptest! {
    #[test]
    fn prop_u8_array_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.asdf");

        let mut af = AsdfFile::new(AsdfConfig::default());
        af.tree_mut().insert("p", NdArray::from_u8(payload.clone()).into());
        af.write_to_path(&path).unwrap();

        let af = AsdfFile::open(&path, AsdfConfig::default()).unwrap();
        let array = af.tree().get("p").and_then(Node::as_array).unwrap();
        let bytes = array.bytes().unwrap();
        prop_assert_eq!(bytes.as_slice(), payload.as_slice());
    }
}
