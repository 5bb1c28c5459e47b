use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tangram_core::Engine;

fn bench_matmul_2d(c: &mut Criterion) {
    let engine = Engine::new();
    let mut group = c.benchmark_group("matmul_2d");
    for size in [16i64, 64, 128] {
        let a = engine.rand(&[size, size], -1.0, 1.0).unwrap();
        let b = engine.rand(&[size, size], -1.0, 1.0).unwrap();
        group.bench_function(format!("{size}x{size}"), |bencher| {
            bencher.iter(|| {
                engine
                    .tidy(None, || black_box(&a).matmul(black_box(&b)))
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_batch_matmul(c: &mut Criterion) {
    let engine = Engine::new();
    let a = engine.rand(&[8, 32, 32], -1.0, 1.0).unwrap();
    let b = engine.rand(&[8, 32, 32], -1.0, 1.0).unwrap();
    c.bench_function("batch_matmul_8x32x32", |bencher| {
        bencher.iter(|| {
            engine
                .tidy(None, || black_box(&a).matmul(black_box(&b)))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_matmul_2d, bench_batch_matmul);
criterion_main!(benches);
