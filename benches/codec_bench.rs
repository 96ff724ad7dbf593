use criterion::{black_box, criterion_group, criterion_main, Criterion};

use asdf_rs::block::calculate_block_checksum;
use asdf_rs::compression;

fn bench_codecs(c: &mut Criterion) {
    let data = vec![0u8; 1024 * 1024];
    c.bench_function("zlib_compress_1mb", |b| {
        b.iter(|| compression::compress(black_box(&data), "zlib", -1))
    });
    c.bench_function("lz4_compress_1mb", |b| {
        b.iter(|| compression::compress(black_box(&data), "lz4", -1))
    });
    c.bench_function("md5_checksum_1mb", |b| {
        b.iter(|| calculate_block_checksum(black_box(&data)))
    });
}

criterion_group!(benches, bench_codecs);
criterion_main!(benches);
