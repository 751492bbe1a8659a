//! Criterion benchmark: single-threaded vs block-parallel gzip of a tar-like payload.
//! Run with: cargo bench --bench gzip_modes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fastdeb::compress::{compress, GzipOptions};
use rand::{rngs::StdRng, Rng, SeedableRng};

const PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

fn payload() -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0xdeb);
    let mut buf = Vec::with_capacity(PAYLOAD_BYTES);
    while buf.len() < PAYLOAD_BYTES {
        // Mix of incompressible runs and repeated text, roughly like a binary package.
        if rng.gen_bool(0.3) {
            let n = rng.gen_range(512..8192);
            buf.extend((0..n).map(|_| rng.gen::<u8>()));
        } else {
            buf.extend_from_slice(b"/usr/lib/x86_64-linux-gnu/libexample.so.1 symbol table entry\n");
        }
    }
    buf.truncate(PAYLOAD_BYTES);
    buf
}

fn bench_modes(c: &mut Criterion) {
    let input = payload();
    let mut group = c.benchmark_group("gzip_modes");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.sample_size(10);

    group.bench_function("single_threaded_l6", |b| {
        let opts = GzipOptions::single_threaded(6);
        b.iter(|| compress(black_box(&input), &opts).unwrap())
    });

    for workers in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("parallel_l6_128k", workers), &workers, |b, &workers| {
            let opts = GzipOptions::parallel(6, workers, 128);
            b.iter(|| compress(black_box(&input), &opts).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_modes);
criterion_main!(benches);
