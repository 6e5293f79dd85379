use criterion::{black_box, criterion_group, criterion_main, Criterion};
use raftkv::backend::memory::MemoryBackend;
use raftkv::backend::Backend;

fn put_n(n: u64) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for i in 0..n {
        let key = format!("key-{:08}", i);
        backend.put(key.as_bytes(), b"value", 0, false).unwrap();
    }
    backend
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("memory backend put 1000", |b| b.iter(|| put_n(black_box(1000))));

    let backend = put_n(10_000);
    c.bench_function("memory backend range over 10000 keys", |b| {
        b.iter(|| backend.range(black_box(b"key-"), Default::default()).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
