//! Benchmarks for the digest path.
//!
//! Throughput of streaming MD5 across representative file sizes; the hash
//! stage dominates first-run backup time, so regressions here matter.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medorg::digest::{hash_file, Digest, Hasher};
use std::io::Write;
use tempfile::NamedTempFile;

fn bench_digest_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_bytes");

    let sizes = vec![
        ("4KB", 4 * 1024),
        ("64KB", 64 * 1024),
        ("1MB", 1024 * 1024),
        ("10MB", 10 * 1024 * 1024),
    ];

    for (name, size) in sizes {
        let data = vec![0x42u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(name), &data, |b, data| {
            b.iter(|| {
                let digest = Digest::of_bytes(black_box(data));
                black_box(digest);
            });
        });
    }

    group.finish();
}

fn bench_digest_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest_file");

    let sizes = vec![
        ("4KB", 4 * 1024),
        ("64KB", 64 * 1024),
        ("1MB", 1024 * 1024),
        ("10MB", 10 * 1024 * 1024),
    ];

    for (name, size) in sizes {
        let mut temp_file = NamedTempFile::new().unwrap();
        let data = vec![0x42u8; size];
        temp_file.write_all(&data).unwrap();
        temp_file.flush().unwrap();

        let path = temp_file.path().to_path_buf();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(name), &path, |b, path| {
            b.iter(|| {
                let digest = hash_file(black_box(path)).unwrap();
                black_box(digest);
            });
        });
    }

    group.finish();
}

fn bench_incremental_chunks(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_chunks");

    let total_size = 1024 * 1024; // 1MB
    let chunk_sizes =
        vec![("4KB chunks", 4 * 1024), ("64KB chunks", 64 * 1024), ("256KB chunks", 256 * 1024)];

    let data = vec![0x42u8; total_size];

    for (name, chunk_size) in chunk_sizes {
        group.throughput(Throughput::Bytes(total_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &chunk_size, |b, &chunk| {
            b.iter(|| {
                let mut hasher = Hasher::new();
                for piece in data.chunks(chunk) {
                    hasher.update(black_box(piece));
                }
                black_box(hasher.finalize());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_digest_bytes,
    bench_digest_file,
    bench_incremental_chunks
);
criterion_main!(benches);
