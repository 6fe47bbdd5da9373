//! Buffer benchmarks: append/consume cycles as the poll loop drives them.
//!
//! Measures: growth policy cost and front-removal cost for typical read sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keel::buffer::Mbuf;

const CHUNK_SIZES: &[usize] = &[64, 1024, 16 * 1024];
const CHUNKS_PER_ITER: usize = 64;

/// Append chunks into a fresh buffer, then drain it.
fn append_then_drain(c: &mut Criterion) {
    keel::dev_tracing::init_tracing();
    let mut group = c.benchmark_group("mbuf/append_then_drain");

    for &size in CHUNK_SIZES {
        let chunk = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes((size * CHUNKS_PER_ITER) as u64));
        group.bench_with_input(BenchmarkId::new("chunk", size), &chunk, |b, chunk| {
            b.iter(|| {
                let mut buf = Mbuf::new();
                for _ in 0..CHUNKS_PER_ITER {
                    buf.append(black_box(chunk));
                }
                black_box(buf.take(buf.len()));
            });
        });
    }
    group.finish();
}

/// Steady state: one read in, one frame out, buffer reused.
fn interleaved(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbuf/interleaved");

    for &size in CHUNK_SIZES {
        let chunk = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("chunk", size), &chunk, |b, chunk| {
            let mut buf = Mbuf::with_capacity(size * 2);
            b.iter(|| {
                buf.append(black_box(chunk));
                buf.remove(black_box(size / 2));
                buf.remove(buf.len());
            });
        });
    }
    group.finish();
}

/// Prepending a small header in front of queued data.
fn insert_header(c: &mut Criterion) {
    let payload = vec![0u8; 4096];
    c.bench_function("mbuf/insert_header", |b| {
        b.iter(|| {
            let mut buf = Mbuf::with_capacity(payload.len() + 16);
            buf.append(&payload);
            buf.insert(0, black_box(&[0x30, 0x80, 0x20]));
            black_box(buf.len())
        });
    });
}

criterion_group!(benches, append_then_drain, interleaved, insert_header);
criterion_main!(benches);
