use std::io::SeekFrom;
use std::sync::OnceLock;

use regex::bytes::Regex;

use asdf_rs::compression::{self, LZ4_BLOCK_SIZE};
use asdf_rs::generic_io::{resolve_uri, uri_stem, FileMode, GenericFile};
use asdf_rs::AsdfError;

fn newline() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n").unwrap())
}

// ── read_until ───────────────────────────────────────────────────────────────

#[test]
fn test_read_until_includes_delimiter_and_pushes_back() {
    let mut fd = GenericFile::from_bytes(b"first line\nsecond".to_vec(), FileMode::Read);
    let line = fd.read_until(newline(), 2, "newline", true, &[], true).unwrap();
    assert_eq!(line, b"first line\n");
    // Everything past the delimiter must still be readable.
    assert_eq!(fd.read(16).unwrap(), b"second");
}

#[test]
fn test_read_until_excluding_delimiter_leaves_it_unread() {
    let mut fd = GenericFile::from_bytes(b"abc|def".to_vec(), FileMode::Read);
    let re = Regex::new(r"\|").unwrap();
    let head = fd.read_until(&re, 2, "pipe", false, &[], true).unwrap();
    assert_eq!(head, b"abc");
    assert_eq!(fd.read(16).unwrap(), b"|def");
}

#[test]
fn test_read_until_missing_delimiter() {
    let mut fd = GenericFile::from_bytes(b"no terminator here".to_vec(), FileMode::Read);
    match fd.read_until(newline(), 2, "newline", true, &[], true) {
        Err(AsdfError::DelimiterNotFound(name)) => assert_eq!(name, "newline"),
        other => panic!("expected DelimiterNotFound, got {other:?}"),
    }
}

#[test]
fn test_read_until_on_input_stream_pushback() {
    let data = b"header\nbody bytes".to_vec();
    let mut fd = GenericFile::from_reader(Box::new(std::io::Cursor::new(data)), None);
    let line = fd.read_until(newline(), 4, "newline", true, &[], true).unwrap();
    assert_eq!(line, b"header\n");
    assert_eq!(fd.read(16).unwrap(), b"body bytes");
}

#[test]
fn test_read_until_delimiter_straddles_block_boundary() {
    // The marker begins just before the first 8 KiB read boundary.
    let block = 8192;
    let mut data = vec![b'x'; block - 1];
    data.extend_from_slice(b"\n...\nrest");
    let mut fd = GenericFile::from_bytes(data, FileMode::Read);
    let re = Regex::new(r"\r?\n\.\.\.((\r?\n)|$)").unwrap();
    let doc = fd.read_until(&re, 8, "end marker", true, &[], true).unwrap();
    assert!(doc.ends_with(b"\n...\n"));
    assert_eq!(fd.read(16).unwrap(), b"rest");
}

// ── Positioning ──────────────────────────────────────────────────────────────

#[test]
fn test_fast_forward_on_stream_reads_and_discards() {
    let data = (0u8..100).collect::<Vec<_>>();
    let mut fd = GenericFile::from_reader(Box::new(std::io::Cursor::new(data)), None);
    fd.fast_forward(10).unwrap();
    assert_eq!(fd.tell().unwrap(), 10);
    assert_eq!(fd.read(1).unwrap(), vec![10]);
}

#[test]
fn test_memory_file_seek_write_truncate() {
    let mut fd = GenericFile::memory_writer();
    fd.write(b"0123456789").unwrap();
    fd.seek(SeekFrom::Start(4)).unwrap();
    fd.write(b"xx").unwrap();
    fd.truncate(8).unwrap();
    fd.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(fd.read(64).unwrap(), b"0123xx67");
}

#[test]
fn test_clear_writes_zeros() {
    let mut fd = GenericFile::memory_writer();
    fd.write(b"ab").unwrap();
    fd.clear(4).unwrap();
    fd.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(fd.read(16).unwrap(), b"ab\0\0\0\0");
}

// ── Atomic path writes ───────────────────────────────────────────────────────

#[test]
fn test_atomic_write_replaces_target_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.bin");
    std::fs::write(&target, b"old contents").unwrap();

    let mut fd = GenericFile::open_path(&target, FileMode::Write).unwrap();
    fd.write(b"new contents").unwrap();
    // Until close, the original must be untouched.
    assert_eq!(std::fs::read(&target).unwrap(), b"old contents");
    fd.close().unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"new contents");
}

// ── URI helpers ──────────────────────────────────────────────────────────────

#[test]
fn test_uri_helpers() {
    assert_eq!(resolve_uri("/data/run7/main.asdf", "main0000.asdf"), "/data/run7/main0000.asdf");
    assert_eq!(resolve_uri("main.asdf", "main0000.asdf"), "main0000.asdf");
    assert_eq!(uri_stem("/data/run7/main.asdf"), "main");
    assert_eq!(uri_stem("main.asdf"), "main");
    assert_eq!(uri_stem("noext"), "noext");
}

// ── Codecs ───────────────────────────────────────────────────────────────────

fn roundtrip_chunked(label: &str, payload: &[u8], chunk: usize) {
    let compressed = compression::compress(payload, label, -1).unwrap();
    let mut decoder = compression::get_compressor(label).unwrap().decompressor();
    let mut out = Vec::new();
    for piece in compressed.chunks(chunk.max(1)) {
        decoder.feed(piece, &mut out).unwrap();
    }
    decoder.finish(&mut out).unwrap();
    assert_eq!(out, payload, "{label} with {chunk}-byte feeds");
}

#[test]
fn test_codec_roundtrips() {
    let payload: Vec<u8> = (0u32..20_000).map(|i| (i % 251) as u8).collect();
    for label in ["zlib", "bzp2", "lz4"] {
        for chunk in [1usize, 7, 4096, usize::MAX.min(1 << 20)] {
            roundtrip_chunked(label, &payload, chunk);
        }
    }
}

#[test]
fn test_zlib_actually_shrinks_repetitive_data() {
    let payload = vec![1u8; 4096];
    let compressed = compression::compress(&payload, "zlib", -1).unwrap();
    assert!(compressed.len() < payload.len());
}

#[test]
fn test_lz4_framing_is_record_oriented() {
    // Spanning two records exercises the re-framing path.
    let payload = vec![9u8; LZ4_BLOCK_SIZE + 17];
    let compressed = compression::compress(&payload, "lz4", -1).unwrap();
    // First record length prefix is big-endian and within bounds.
    let record_len = u32::from_be_bytes([
        compressed[0],
        compressed[1],
        compressed[2],
        compressed[3],
    ]) as usize;
    assert!(record_len > 0 && record_len + 4 <= compressed.len());
    assert_eq!(compression::decompress(&compressed, "lz4").unwrap(), payload);
}

#[test]
fn test_unknown_compression_label() {
    match compression::validate(b"zstd") {
        Err(AsdfError::UnknownCompression(label)) => assert_eq!(label, "zstd"),
        other => panic!("expected UnknownCompression, got {other:?}"),
    }
}

#[test]
fn test_label_field_roundtrip() {
    assert_eq!(compression::to_label_field(Some("lz4")), *b"\0lz4");
    assert_eq!(compression::to_label_field(Some("zlib")), *b"zlib");
    assert_eq!(compression::to_label_field(None), [0u8; 4]);
    assert_eq!(compression::validate(b"\0lz4").unwrap().as_deref(), Some("lz4"));
    assert_eq!(compression::validate(b"lz4\0").unwrap().as_deref(), Some("lz4"));
    assert_eq!(compression::validate(&[0u8; 4]).unwrap(), None);
}
